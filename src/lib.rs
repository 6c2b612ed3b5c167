//! unravel - reconstructs the minimal standalone source code that recreates a
//! Python object.
//!
//! Given a captured reference to an object (modeled as a call-frame stack plus
//! registered module sources), unravel statically resolves which textual
//! definition created each name, walks the free variables of that definition,
//! and emits an ordered, deduplicated source dump that can be executed on its
//! own to rebuild the object.
//!
//! The main pieces:
//! - [`text`]: positions, span conversion, and virtual source edits
//! - [`scope`]: lexical scopes, scoped names, and call-argument binding
//! - [`finder`]: locating the statement that defines a name
//! - [`graph`]: free-variable analysis and the dependency code graph
//! - [`frame`]: the explicit call-frame model and call-site recovery
//! - [`session`]: parse cache, module registry, and interactive history
//! - [`adapter`]: interfaces to packaging, serialization, and introspection

pub mod adapter;
pub mod ast_utils;
pub mod builtins;
pub mod error;
pub mod finder;
pub mod frame;
pub mod graph;
pub mod scope;
pub mod session;
pub mod text;

pub use adapter::{
    ModuleIntrospector, NullIntrospector, NullRewriter, NullScanner, NullSerializer,
    ParamRewriter, RequirementError, RequirementsScanner, Serializer,
};
pub use error::{OutputErrorCode, Result, UnravelError};
pub use frame::{CallInfo, CallOrigin, Frame, FrameStack};
pub use graph::{
    build_codegraph, build_codegraph_for_name, check_requirements, dumps, BuildOptions, CodeGraph,
    CodeNode,
};
pub use scope::{Scope, ScopedName, Signature};
pub use session::Session;
pub use text::{Position, ReplacedString, SourceText};
