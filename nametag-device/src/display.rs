//! Display payloads: glyph strips and animation frames
//!
//! The badge's panel is 48×12, one bit per pixel. Rendering (fonts,
//! images, composition) happens elsewhere; this module only validates the
//! bitmaps and lays out the upload bodies.
//!
//! Bitmaps are column-major: two bytes per pixel column (12 rows padded
//! to 16 bits), leftmost column first.

use crate::error::ProtocolError;

/// Panel height in pixels; every glyph and frame is this tall.
pub const PANEL_HEIGHT: usize = 12;
/// Panel width in pixels; animation frames are exactly this wide.
pub const PANEL_WIDTH: usize = 48;
/// Bytes per pixel column (12 rows, 1 bpp, padded to whole bytes).
pub const BYTES_PER_COLUMN: usize = 2;
/// The glyph-strip header has 80 length slots.
pub const MAX_GLYPHS: usize = 80;

/// One glyph: a 1-bpp bitmap, height 12, width 1..=48.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glyph {
    width: usize,
    bits: Vec<u8>,
}

impl Glyph {
    /// Validate a bitmap of `width` × `height` pixels in column-major
    /// order.
    pub fn new(width: usize, height: usize, bits: Vec<u8>) -> Result<Glyph, ProtocolError> {
        if height != PANEL_HEIGHT || width < 1 || width > PANEL_WIDTH {
            return Err(ProtocolError::BadGlyph { width, height });
        }
        if bits.len() != width * BYTES_PER_COLUMN {
            return Err(ProtocolError::BadGlyph { width, height });
        }
        Ok(Glyph { width, bits })
    }

    /// An all-dark glyph (spacing).
    pub fn blank(width: usize) -> Result<Glyph, ProtocolError> {
        Glyph::new(width, PANEL_HEIGHT, vec![0; width * BYTES_PER_COLUMN])
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }
}

/// One animation frame: a full-panel 48×12 bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bits: Vec<u8>,
}

impl Frame {
    /// Validate a bitmap of `width` × `height` pixels in column-major
    /// order. Only (48, 12) is accepted.
    pub fn new(width: usize, height: usize, bits: Vec<u8>) -> Result<Frame, ProtocolError> {
        if width != PANEL_WIDTH
            || height != PANEL_HEIGHT
            || bits.len() != PANEL_WIDTH * BYTES_PER_COLUMN
        {
            return Err(ProtocolError::BadAnimationFrame { width, height });
        }
        Ok(Frame { bits })
    }

    /// An all-dark frame.
    pub fn blank() -> Frame {
        Frame {
            bits: vec![0; PANEL_WIDTH * BYTES_PER_COLUMN],
        }
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }
}

/// Lay out the glyph-strip upload body:
/// `24×0 · count_u8 · lengths[80] · total_be16 · bitmaps`.
///
/// The 80-slot table holds per-glyph bitmap *byte* lengths, zero-padded.
pub fn glyph_body(glyphs: &[Glyph]) -> Result<Vec<u8>, ProtocolError> {
    if glyphs.is_empty() {
        return Err(ProtocolError::EmptyDisplay);
    }
    if glyphs.len() > MAX_GLYPHS {
        return Err(ProtocolError::TooManyGlyphs(glyphs.len()));
    }
    let total: usize = glyphs.iter().map(|g| g.bits.len()).sum();

    let mut body = vec![0u8; 24];
    body.push(glyphs.len() as u8);
    let mut lengths = [0u8; MAX_GLYPHS];
    for (slot, glyph) in lengths.iter_mut().zip(glyphs) {
        *slot = glyph.bits.len() as u8;
    }
    body.extend_from_slice(&lengths);
    body.extend_from_slice(&(total as u16).to_be_bytes());
    for glyph in glyphs {
        body.extend_from_slice(&glyph.bits);
    }
    Ok(body)
}

/// Lay out the animation upload body:
/// `24×0 · frame_count_u8 · frame_msec_be16 · frames`.
pub fn animation_body(frames: &[Frame], msec: u16) -> Result<Vec<u8>, ProtocolError> {
    if frames.is_empty() {
        return Err(ProtocolError::EmptyDisplay);
    }
    if frames.len() > u8::MAX as usize {
        return Err(ProtocolError::TooManyFrames(frames.len()));
    }
    let mut body = vec![0u8; 24];
    body.push(frames.len() as u8);
    body.extend_from_slice(&msec.to_be_bytes());
    for frame in frames {
        body.extend_from_slice(&frame.bits);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glyph_bounds() {
        assert!(Glyph::blank(1).is_ok());
        assert!(Glyph::blank(48).is_ok());
        assert!(matches!(
            Glyph::blank(0),
            Err(ProtocolError::BadGlyph { width: 0, .. })
        ));
        assert!(matches!(
            Glyph::blank(49),
            Err(ProtocolError::BadGlyph { width: 49, .. })
        ));
        assert!(Glyph::new(4, 11, vec![0; 8]).is_err());
        assert!(Glyph::new(4, 12, vec![0; 7]).is_err());
    }

    #[test]
    fn frame_bounds() {
        assert!(Frame::new(48, 12, vec![0; 96]).is_ok());
        assert!(matches!(
            Frame::new(47, 12, vec![0; 94]),
            Err(ProtocolError::BadAnimationFrame {
                width: 47,
                height: 12
            })
        ));
        assert!(Frame::new(48, 11, vec![0; 96]).is_err());
        assert!(Frame::new(48, 12, vec![0; 95]).is_err());
    }

    #[test]
    fn glyph_body_layout() {
        let glyphs = vec![
            Glyph::new(2, 12, vec![0xAA; 4]).unwrap(),
            Glyph::new(3, 12, vec![0xBB; 6]).unwrap(),
        ];
        let body = glyph_body(&glyphs).unwrap();
        assert_eq!(&body[..24], &[0u8; 24]);
        assert_eq!(body[24], 2); // glyph count
        assert_eq!(body[25], 4); // first bitmap length
        assert_eq!(body[26], 6); // second bitmap length
        assert_eq!(&body[27..105], &[0u8; 78]); // unused slots
        assert_eq!(u16::from_be_bytes([body[105], body[106]]), 10);
        assert_eq!(&body[107..111], &[0xAA; 4]);
        assert_eq!(&body[111..117], &[0xBB; 6]);
        assert_eq!(body.len(), 117);
    }

    #[test]
    fn animation_body_layout() {
        let frames = vec![Frame::blank(), Frame::blank()];
        let body = animation_body(&frames, 250).unwrap();
        assert_eq!(&body[..24], &[0u8; 24]);
        assert_eq!(body[24], 2);
        assert_eq!(u16::from_be_bytes([body[25], body[26]]), 250);
        assert_eq!(body.len(), 27 + 2 * 96);
    }

    #[test]
    fn empty_uploads_are_rejected() {
        assert!(matches!(glyph_body(&[]), Err(ProtocolError::EmptyDisplay)));
        assert!(matches!(
            animation_body(&[], 250),
            Err(ProtocolError::EmptyDisplay)
        ));
    }
}
