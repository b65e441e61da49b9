pub mod frontend;
pub mod geometry;
pub mod map;
pub mod optimizer;
pub mod pipeline;
