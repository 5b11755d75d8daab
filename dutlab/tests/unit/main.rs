//! Integration tests

#[allow(dead_code)]
mod helpers;
mod test_boot;
mod test_flash;
mod test_fleet;
mod test_image;
mod test_pool;
