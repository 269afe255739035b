//! The process's serialized execution context and the host capabilities it
//! uses to load and adopt code.
//!
//! Anything that mutates shared runtime state is submitted through a
//! [`MainQueue`] and executed by [`run_main_loop`] on the host's main thread.

mod dylib;
mod host;
mod images;
mod loop_impl;
mod request;
mod symbols;
mod worker;

pub use dylib::{DylibLoader, EntryPointReplacer, SymbolTableScanner, PATCH_ENTRY_SYMBOL};
pub use host::{
    LoadedModule, ModuleLoader, ModuleSymbolScanner, OneTimeInitializer, ScannedSymbol,
    SymbolReplacer,
};
pub use images::{ImageLister, LiveImages};
pub use loop_impl::{drain_main_queue, run_main_loop, MainContext};
pub use request::MainRequest;
pub use symbols::{address_in_image, defined_symbols};
pub use worker::{main_queue, MainQueue};
