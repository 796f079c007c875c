//! Link-time configuration consulted by the scanner and resolver. Command-line parsing happens
//! elsewhere; this is the already-digested form.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    StaticExecutable(RelocationModel),
    DynamicExecutable(RelocationModel),
    SharedObject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationModel {
    /// Code is linked to run at a fixed address.
    NonRelocatable,

    /// Position-independent code that can run at an arbitrary base address.
    Relocatable,
}

impl OutputKind {
    #[must_use]
    pub fn is_executable(self) -> bool {
        !matches!(self, OutputKind::SharedObject)
    }

    #[must_use]
    pub fn is_static_executable(self) -> bool {
        matches!(self, OutputKind::StaticExecutable(_))
    }

    #[must_use]
    pub fn is_shared_object(self) -> bool {
        matches!(self, OutputKind::SharedObject)
    }

    #[must_use]
    pub fn is_relocatable(self) -> bool {
        matches!(
            self,
            OutputKind::StaticExecutable(RelocationModel::Relocatable)
                | OutputKind::DynamicExecutable(RelocationModel::Relocatable)
                | OutputKind::SharedObject
        )
    }
}

/// What to do about a reference to a symbol that no input defines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    Error,
    Warn,
    Ignore,
}

pub struct LinkConfig {
    pub output_kind: OutputKind,

    /// Refuse dynamic relocations in read-only sections.
    pub z_text: bool,

    /// Sort combined dynamic relocations. When off, scanning runs serially so that relocation
    /// order matches input order exactly.
    pub z_combreloc: bool,

    /// Allow copy relocations for data symbols from shared objects.
    pub z_copyreloc: bool,

    /// Emit direct dynamic relocations for ifuncs instead of PLT stubs.
    pub z_ifunc_noplt: bool,

    pub unresolved: UnresolvedPolicy,

    /// Keep going (with warnings) when undefined symbols would otherwise be errors.
    pub no_inhibit_exec: bool,
}

impl LinkConfig {
    #[must_use]
    pub fn new(output_kind: OutputKind) -> Self {
        Self {
            output_kind,
            z_text: false,
            z_combreloc: true,
            z_copyreloc: true,
            z_ifunc_noplt: false,
            unresolved: UnresolvedPolicy::Error,
            no_inhibit_exec: false,
        }
    }

    #[must_use]
    pub fn is_pic(&self) -> bool {
        self.output_kind.is_relocatable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OutputKind::StaticExecutable(RelocationModel::NonRelocatable), false, true)]
    #[case(OutputKind::StaticExecutable(RelocationModel::Relocatable), true, true)]
    #[case(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable), false, true)]
    #[case(OutputKind::DynamicExecutable(RelocationModel::Relocatable), true, true)]
    #[case(OutputKind::SharedObject, true, false)]
    fn output_kind_properties(
        #[case] kind: OutputKind,
        #[case] relocatable: bool,
        #[case] executable: bool,
    ) {
        assert_eq!(kind.is_relocatable(), relocatable);
        assert_eq!(kind.is_executable(), executable);
    }
}
