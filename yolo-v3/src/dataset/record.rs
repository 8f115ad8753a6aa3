use crate::{bbox::RatioRect, common::*};

/// One annotated image with its ground truth boxes, without image pixels.
///
/// Boxes keep their class *names*. Class indices are bound later, once the
/// class set of the run is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageAnnotation {
    pub path: PathBuf,
    /// Image height in pixels.
    pub height: usize,
    /// Image width in pixels.
    pub width: usize,
    pub objects: Vec<NamedBox>,
}

/// A ground truth box paired with its class name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedBox {
    pub name: String,
    pub rect: RatioRect,
}
