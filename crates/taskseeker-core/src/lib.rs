pub mod data_dir;
pub mod image;
pub mod settings;
pub mod text;

pub use image::CapturedImage;
pub use settings::{Settings, SettingsPatch};
