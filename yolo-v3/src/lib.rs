//! YOLOv3 detection model, dataset pipeline and evaluation toolkit.

pub mod bbox;
pub mod common;
pub mod dataset;
pub mod eval;
pub mod loss;
pub mod model;
