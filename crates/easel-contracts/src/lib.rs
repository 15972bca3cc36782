pub mod canvas;
pub mod events;
pub mod jobs;
pub mod styles;
