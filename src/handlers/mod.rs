//! Built-in node handlers: one per kind of form input.
pub mod image;
pub mod switch;
pub mod text;

pub use image::ImageInputHandler;
pub use switch::SwitchInputHandler;
pub use text::TextInputHandler;
