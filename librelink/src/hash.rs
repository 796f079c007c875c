//! Hash maps keyed with a faster hash function than the default SipHash. We don't need DoS
//! resistance, since all of our inputs come from files we were asked to link.

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, foldhash::fast::RandomState>;
pub(crate) type HashSet<K> = std::collections::HashSet<K, foldhash::fast::RandomState>;
