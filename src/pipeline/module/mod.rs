pub mod bbox_refinement;
pub mod mask_decoding;
pub mod proposal;
