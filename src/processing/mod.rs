pub mod bbox_regression;
pub mod mask;
pub mod merge;
pub mod nms;
