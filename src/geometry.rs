//! Rectangle arithmetic and raster composition.
//!
//! Coordinates are page units with the origin at the top-left corner and `y`
//! growing downwards, so "below" means a larger `y`.

use crate::error::Doc2MdError;
use image::{imageops, DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle `(x0, y0, x1, y1)`, with `x0 <= x1` and `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    /// Build a rectangle from two corners in any order.
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
}

/// True unless `a` and `b` are separated by more than `padding` along either axis.
///
/// Symmetric in its arguments and monotone in `padding`; not transitive.
pub fn adjacent_or_overlapping(a: &Rect, b: &Rect, padding: f32) -> bool {
    let separated = a.x1 + padding < b.x0
        || a.x0 - padding > b.x1
        || a.y1 + padding < b.y0
        || a.y0 - padding > b.y1;
    !separated
}

/// Tightest box around `rects`, shifted down by half its own height.
///
/// The shift places an annotation written into the box just below the
/// region the images used to occupy.
pub fn union_bounding_box(rects: &[Rect]) -> Result<Rect, Doc2MdError> {
    let (first, rest) = rects.split_first().ok_or_else(|| Doc2MdError::InvalidInput {
        input: "empty rectangle set".into(),
    })?;

    let mut bbox = *first;
    for r in rest {
        bbox.x0 = bbox.x0.min(r.x0);
        bbox.y0 = bbox.y0.min(r.y0);
        bbox.x1 = bbox.x1.max(r.x1);
        bbox.y1 = bbox.y1.max(r.y1);
    }

    let shift = bbox.height() / 2.0;
    bbox.y0 += shift;
    bbox.y1 += shift;
    Ok(bbox)
}

/// How the frames of a composite are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeDirection {
    /// Top to bottom, left-aligned.
    Vertical,
    /// Left to right, top-aligned.
    Horizontal,
}

/// Stack `images` into one RGB canvas in input order.
///
/// Uncovered canvas area is black. Fails with `InvalidInput` when `images`
/// is empty.
pub fn compose_raster(
    images: &[DynamicImage],
    direction: MergeDirection,
) -> Result<RgbImage, Doc2MdError> {
    if images.is_empty() {
        return Err(Doc2MdError::InvalidInput {
            input: "empty image set".into(),
        });
    }

    let (width, height) = match direction {
        MergeDirection::Vertical => (
            images.iter().map(|i| i.width()).max().unwrap_or(0),
            images.iter().map(|i| i.height()).sum(),
        ),
        MergeDirection::Horizontal => (
            images.iter().map(|i| i.width()).sum(),
            images.iter().map(|i| i.height()).max().unwrap_or(0),
        ),
    };

    let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
    let mut offset: i64 = 0;
    for img in images {
        let frame = img.to_rgb8();
        match direction {
            MergeDirection::Vertical => {
                imageops::replace(&mut canvas, &frame, 0, offset);
                offset += i64::from(frame.height());
            }
            MergeDirection::Horizontal => {
                imageops::replace(&mut canvas, &frame, offset, 0);
                offset += i64::from(frame.width());
            }
        }
    }
    Ok(canvas)
}
