//! firmforge: natural-language instructions in, flashable firmware out.
//!
//! A request flows through [`pipeline::Pipeline`]: the instruction is turned
//! into source by a language model ([`generate`]), written into an isolated
//! [`workspace`], compiled by an external toolchain ([`build`]), and the
//! resulting image is located ([`artifact`]) and base64-encoded ([`encode`]).
//! [`server`] exposes the pipeline over HTTP.

pub mod artifact;
pub mod build;
pub mod config;
pub mod encode;
pub mod errors;
pub mod generate;
pub mod pipeline;
pub mod server;
pub mod workspace;
