use image::DynamicImage;
use std::io::Cursor;

/// Read the EXIF orientation tag (1..=8) from an encoded image, if present.
pub fn read_orientation(bytes: &[u8]) -> Option<u32> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;

    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .filter(|value| (1..=8).contains(value))
}

/// Rotate/flip pixels so the image is upright for the given orientation tag.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        // Transpose
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        // Transverse
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}
