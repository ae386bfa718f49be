//! Functions shipped with the binary.
//!
//! Each sub-module contributes one [`ToolType`](crate::functions::ToolType);
//! [`register`] adds all of them to a registry under the `Builtins`
//! namespace so pilot configuration can reference them by name, e.g.
//! `Builtins.Clock.Now`.

pub mod clock;

use crate::functions::FunctionRegistry;

/// Namespace every built-in type lives under.
pub const NAMESPACE: &str = "Builtins";

/// Register every built-in type.
pub fn register(registry: &mut FunctionRegistry) {
    registry.register_type(clock::tool_type());
}
