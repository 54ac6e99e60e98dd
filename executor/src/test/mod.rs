mod docker_tests;
pub mod util;
