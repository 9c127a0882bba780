use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Front cover, as numbered by the FLAC picture block.
const FRONT_COVER: u32 = 3;

/// Encodes cover art as a base64 FLAC `METADATA_BLOCK_PICTURE`, the form Ogg
/// containers carry pictures in (as a comment rather than a video stream).
pub fn picture_block(image: &[u8], mime_type: &str, description: &str, width: u32, height: u32) -> String {
    let mut block = Vec::with_capacity(32 + mime_type.len() + description.len() + image.len());
    block.extend_from_slice(&FRONT_COVER.to_be_bytes());
    push_sized(&mut block, mime_type.as_bytes());
    push_sized(&mut block, description.as_bytes());
    block.extend_from_slice(&width.to_be_bytes());
    block.extend_from_slice(&height.to_be_bytes());
    // Colour depth, then palette size (zero for non-indexed images).
    block.extend_from_slice(&24u32.to_be_bytes());
    block.extend_from_slice(&0u32.to_be_bytes());
    push_sized(&mut block, image);
    STANDARD.encode(block)
}

fn push_sized(block: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    block.extend_from_slice(&len.to_be_bytes());
    block.extend_from_slice(&bytes[..len as usize]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picture_block_layout() {
        let encoded = picture_block(b"\x89PNG", "image/png", "Cover", 600, 400);
        let block = STANDARD.decode(encoded).unwrap();
        let word = |at: usize| u32::from_be_bytes(block[at..at + 4].try_into().unwrap());
        assert_eq!(word(0), 3);
        assert_eq!(word(4), 9);
        assert_eq!(&block[8..17], b"image/png");
        assert_eq!(word(17), 5);
        assert_eq!(&block[21..26], b"Cover");
        assert_eq!(word(26), 600);
        assert_eq!(word(30), 400);
        assert_eq!(word(34), 24);
        assert_eq!(word(38), 0);
        assert_eq!(word(42), 4);
        assert_eq!(&block[46..], b"\x89PNG");
    }
}
