//! The three fatal error taxonomies.
//!
//! A safety panic means user code attempted an access the capability model
//! forbids. An internal panic means the runtime or the compiler contract is
//! broken. A user panic is a deliberate abort requested by user code. All
//! three terminate the process; they differ only in how they report.

use crate::origin::Origin;
use crate::thread::Mutator;

fn report_origin_stack(origin: Option<&Origin>) {
    if let Some(origin) = origin {
        for frame in origin.inline_chain() {
            rt_log!("    at {}", frame);
        }
    }
    unsafe {
        let mutator = Mutator::current();
        if !mutator.is_null() {
            let mut frame = (*mutator).top_frame();
            while !frame.is_null() {
                let origin = (*frame).origin;
                if !origin.is_null() {
                    for entry in (*origin).inline_chain() {
                        rt_log!("    at {}", entry);
                    }
                }
                frame = (*frame).parent;
            }
        }
    }
}

fn die() -> ! {
    if crate::runtime_initialized() && crate::runtime().config.exit_on_panic {
        std::process::exit(42);
    }
    std::process::abort();
}

/// A memory-safety violation detected by an access or invariant check.
#[cold]
pub fn safety_panic(origin: Option<&Origin>, args: std::fmt::Arguments) -> ! {
    let message = format!("{}", args);
    rt_log!("fugc safety error: {}", message);
    report_origin_stack(origin);
    #[cfg(test)]
    {
        if test_hook::try_capture(message) {
            std::panic::panic_any(test_hook::CapturedSafetyPanic);
        }
    }
    let _ = message;
    die()
}

/// Test-only capture of safety panics: an armed thread records the message
/// and unwinds instead of aborting, so checks can be asserted against.
#[cfg(test)]
pub(crate) mod test_hook {
    use std::cell::{Cell, RefCell};

    pub struct CapturedSafetyPanic;

    thread_local! {
        static ARMED: Cell<bool> = Cell::new(false);
        static MESSAGE: RefCell<Option<String>> = RefCell::new(None);
    }

    pub fn arm() {
        ARMED.with(|armed| armed.set(true));
    }

    pub fn disarm_and_take() -> Option<String> {
        ARMED.with(|armed| armed.set(false));
        MESSAGE.with(|message| message.borrow_mut().take())
    }

    pub(crate) fn try_capture(message: String) -> bool {
        if ARMED.with(|armed| armed.get()) {
            MESSAGE.with(|slot| *slot.borrow_mut() = Some(message));
            true
        } else {
            false
        }
    }
}

/// A broken runtime/compiler contract. Implies a bug in the runtime, not in
/// the user program.
#[cold]
pub fn internal_panic(args: std::fmt::Arguments) -> ! {
    rt_log!("fugc internal error: {}", args);
    rt_log!("{:?}", backtrace::Backtrace::new());
    std::process::abort();
}

/// A user-requested abort.
#[cold]
pub fn user_panic(origin: Option<&Origin>, args: std::fmt::Arguments) -> ! {
    rt_log!("fugc user error: {}", args);
    report_origin_stack(origin);
    die()
}

#[macro_export]
macro_rules! safety_check {
    ($cond:expr, $origin:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::panic::safety_panic($origin, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! internal_check {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::panic::internal_panic(format_args!($($arg)*));
        }
    };
}
