//! Handles into an assembly's part arena.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable handle to a part inside one [`Assembly`](super::Assembly).
///
/// Handles are never reused within an assembly, so a relation holding a
/// handle to a removed part can be detected instead of silently pointing at
/// whichever part took its slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartId(pub u32);

impl fmt::Debug for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartId({})", self.0)
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering_and_display() {
        assert!(PartId(1) < PartId(2));
        assert_eq!(PartId(7).to_string(), "#7");
        assert_eq!(format!("{:?}", PartId(7)), "PartId(7)");
    }
}
