pub mod hash;
pub mod local;
pub mod metadata;

pub use hash::compute_hash;
pub use local::{LocalFileStorage, StoredObject};
pub use metadata::ObjectMetadata;

pub fn get_extension_from_mime_type(mime_type: &str) -> &str {
    match mime_type.to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        _ => "bin",
    }
}

pub fn asset_prefix(asset_id: &str) -> String {
    format!("idphoto/{asset_id}")
}

pub fn input_key(asset_id: &str, ext: &str) -> String {
    format!("{}/input.{ext}", asset_prefix(asset_id))
}

pub fn preview_key(asset_id: &str, ext: &str) -> String {
    format!("{}/preview.{ext}", asset_prefix(asset_id))
}

pub fn hd_key(asset_id: &str, ext: &str) -> String {
    format!("{}/hd.{ext}", asset_prefix(asset_id))
}
