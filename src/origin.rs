//! Static origin records attributing runtime events to source locations.
//!
//! Compiled functions carry one `FunctionOrigin` each; every interesting
//! source point in the function gets an `Origin` referencing an `OriginNode`.
//! Inlined code hangs a chain of origin nodes off the leaf node so a single
//! program counter can be attributed to every inlined frame.

use crate::ptr::Ptr;

pub struct FunctionOrigin {
    pub function: &'static str,
    pub filename: &'static str,
    /// Number of object slots live in this function's frame at any safepoint.
    pub num_lowers_ish: u32,
    /// The last `num_setjmps` slots are reserved for jmp_buf objects.
    pub num_setjmps: u32,
    pub can_throw: bool,
    pub can_catch: bool,
    pub personality_getter: Option<fn() -> Ptr>,
}

pub struct OriginNode {
    pub function_origin: &'static FunctionOrigin,
    /// Set when this node describes code inlined into another function.
    pub inline_parent: Option<&'static Origin>,
}

pub struct Origin {
    pub node: &'static OriginNode,
    pub line: u32,
    pub column: u32,
}

impl Origin {
    /// The origin itself followed by every frame it was inlined into.
    pub fn inline_chain(&self) -> InlineChain<'_> {
        InlineChain {
            current: Some(self),
        }
    }
}

pub struct InlineChain<'a> {
    current: Option<&'a Origin>,
}

impl<'a> Iterator for InlineChain<'a> {
    type Item = &'a Origin;
    fn next(&mut self) -> Option<&'a Origin> {
        let current = self.current.take()?;
        self.current = current.node.inline_parent.map(|origin| origin as &'a Origin);
        Some(current)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fo = self.node.function_origin;
        write!(
            f,
            "{} ({}:{}:{})",
            fo.function, fo.filename, self.line, self.column
        )
    }
}

/// Define a static origin for a runtime-internal function.
#[macro_export]
macro_rules! runtime_origin {
    ($name:ident, $function:expr, $num_lowers:expr) => {
        pub static $name: $crate::origin::Origin = {
            static FUNCTION_ORIGIN: $crate::origin::FunctionOrigin =
                $crate::origin::FunctionOrigin {
                    function: $function,
                    filename: "<runtime>",
                    num_lowers_ish: $num_lowers,
                    num_setjmps: 0,
                    can_throw: false,
                    can_catch: false,
                    personality_getter: None,
                };
            static NODE: $crate::origin::OriginNode = $crate::origin::OriginNode {
                function_origin: &FUNCTION_ORIGIN,
                inline_parent: None,
            };
            $crate::origin::Origin {
                node: &NODE,
                line: 0,
                column: 0,
            }
        };
    };
}
