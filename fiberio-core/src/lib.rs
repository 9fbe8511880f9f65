#![warn(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    elided_lifetimes_in_paths,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences,

    clippy::all,
    clippy::pedantic,
    clippy::cargo,
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::panic_in_result_fn,
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::indexing_slicing,
    clippy::separated_literal_suffix, // conflicts with clippy::unseparated_literal_suffix
)]

//! A stackful fiber runtime: an N:M scheduler, an epoll reactor with timers,
//! and cooperative replacements for blocking syscalls.

#[allow(missing_docs)]
pub mod log;

/// Common traits and impl.
#[allow(unsafe_code)]
pub mod common;

/// Blocking the current thread.
pub mod blocker;

/// Process wide tunables.
pub mod config;

/// Stackful fibers.
#[allow(unsafe_code)]
pub mod fiber;

/// Scheduler abstraction and impl.
pub mod scheduler;

/// The epoll reactor.
#[allow(unsafe_code)]
pub mod reactor;

/// Per descriptor bookkeeping for hooked syscalls.
pub mod fd;

/// Cooperative syscalls.
#[allow(
    missing_docs,
    unsafe_code,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::missing_safety_doc
)]
pub mod syscall;
