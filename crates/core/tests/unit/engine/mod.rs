/// Native engine binding driven through a fake library.
pub mod native;
