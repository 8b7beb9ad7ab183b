pub mod cache;
pub mod fetch;
pub mod lora;
pub mod manifest;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod upscale;
