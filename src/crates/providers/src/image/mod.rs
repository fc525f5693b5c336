//! Image generation adapters.

pub mod text_to_image;

pub use text_to_image::TextToImageAdapter;
