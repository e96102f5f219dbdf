pub mod frames;
pub mod mat;
pub mod npy;
