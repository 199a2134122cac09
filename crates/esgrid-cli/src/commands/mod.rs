pub mod launch;
pub mod render;
