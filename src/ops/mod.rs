pub mod adjustments;
pub mod brain;
pub mod clahe;
pub mod denoise;
pub mod filters;
pub mod morphology;
pub mod segmentation;
