//! Error taxonomy of the renderer.
//!
//! None of these errors terminate the render loop. Compile errors drop the
//! draws that need the failed program, load errors substitute a placeholder,
//! and a lost context pauses the frame loop until it is restored.

use thiserror::Error;

/// Shader preprocessing, compilation or linking failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// The `#ifdef`/`#endif` structure of a template is broken.
    #[error("preprocessing failed at line {line}: {message}")]
    Preprocess { line: usize, message: String },

    /// The device rejected the generated source. `log` holds the compiler output.
    #[error("compilation of `{label}` failed:\n{log}")]
    Compile { label: String, log: String },

    /// Stages compiled but could not be linked into a program.
    #[error("linking of `{label}` failed:\n{log}")]
    Link { label: String, log: String },

    #[error("device context is lost")]
    ContextLost,
}

/// A texture or geometry could not be fetched or decoded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceLoadError {
    #[error("could not fetch `{url}`: {reason}")]
    Fetch { url: String, reason: String },

    #[error("could not decode `{url}`: {reason}")]
    Decode { url: String, reason: String },
}

/// Failures reported by a [`crate::device::GraphicsDevice`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device context is lost")]
    ContextLost,

    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    #[error("surface error: {0}")]
    Surface(String),
}

/// Geometry data does not match the attribute schema.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("attribute `{name}` has {len} floats which is not a multiple of its size {size}")]
    AttributeSize {
        name: String,
        len: usize,
        size: usize,
    },

    #[error("attribute `{name}` has {count} elements but position has {expected}")]
    AttributeCount {
        name: String,
        count: usize,
        expected: usize,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}
