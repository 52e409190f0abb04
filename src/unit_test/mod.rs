mod synthetic;

pub(crate) use synthetic::{
    descriptor_for, forward_scene, populate_map_from_frame, static_scene, SyntheticEngine,
    SyntheticScene, SyntheticSource,
};
