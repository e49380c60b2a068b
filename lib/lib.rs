#![allow(dead_code, non_snake_case, non_upper_case_globals)]

pub mod error;
pub mod comm;
pub mod quadrature;
pub mod spectrum;
pub mod chain;
pub mod system;
pub mod boundary;
pub mod occupation;
pub mod interval;
pub mod onebody;
pub mod manybody;
