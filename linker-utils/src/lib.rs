pub mod elf;
pub mod expr;
