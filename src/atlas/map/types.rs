//! Core ID types for the Atlas map structures.
//!
//! Ids are lightweight handles used for every cross-entity link, so the
//! map never needs `Arc`/`Rc` cycles between keyframes and landmarks.

use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $inner:ty, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn new(id: $inner) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a KeyFrame.
    ///
    /// Keyframe ids come from one counter shared by every map in the atlas,
    /// so they stay unique when maps are merged or reloaded.
    KeyFrameId,
    u64,
    "KF"
);

entity_id!(
    /// Unique identifier for a MapPoint (3D point landmark).
    MapPointId,
    u64,
    "MP"
);

entity_id!(
    /// Unique identifier for a MapLine (3D line landmark).
    MapLineId,
    u64,
    "ML"
);

entity_id!(
    /// Identifier of a map inside the atlas.
    MapId,
    u64,
    "Map"
);

entity_id!(
    /// Identifier of a camera model referenced by keyframes.
    CameraId,
    u32,
    "Cam"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_equality() {
        let id1 = KeyFrameId::new(42);
        let id2 = KeyFrameId::new(42);
        let id3 = KeyFrameId::new(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert!(id1 < id3);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
        assert_eq!(format!("{}", MapLineId::new(7)), "ML7");
        assert_eq!(format!("{}", MapId::new(2)), "Map2");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<KeyFrameId, &str> = HashMap::new();
        map.insert(KeyFrameId::new(1), "first");
        map.insert(KeyFrameId::new(2), "second");

        assert_eq!(map.get(&KeyFrameId::new(1)), Some(&"first"));
        assert_eq!(map.get(&KeyFrameId::new(3)), None);
    }
}
