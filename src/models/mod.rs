pub mod mantle;
