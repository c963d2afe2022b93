//! src/glue/result.rs
//! The domain result-code taxonomy: a 32-bit tagged value
//! with a module id and a description, distinct from the ambient
//! [`crate::error::Error`] used at the outer edges (config/IO). Every
//! fallible operation in `ukern`, `mem`, `async_task`, `file_device` and
//! `resource` returns this `Result`, not the ambient one, because callers
//! need to branch on the code (retry on `MemoryAllocationFailure`, treat
//! `FileNotFound` as non-fatal, abort on an inconsistent-state code).

use std::fmt;

/// 9-bit module id (`async`, `res`, `frm`, `resbui`, plus `ukern` and `mem`
/// added here to cover the modules the original taxonomy lists only by
/// example).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Module {
    Ukern = 1,
    Mem = 2,
    Async = 3,
    Res = 4,
    Frm = 5,
    ResBui = 6,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Module::Ukern => "ukern",
            Module::Mem => "mem",
            Module::Async => "async",
            Module::Res => "res",
            Module::Frm => "frm",
            Module::ResBui => "resbui",
        };
        f.write_str(s)
    }
}

/// A 13-bit description code, scoped to its module. Values are only unique
/// within a module, matching ("32-bit tagged values with a 9-bit
/// module id and a 13-bit description").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Success,

    // ukern
    Timeout,
    InvalidHandle,
    InvalidWaitAddressValue,

    // mem
    OutOfMemory,
    AddressNotInHeap,
    DoubleFree,
    NotHeapOwner,

    // async
    Incomplete,
    AlreadyQueued,
    InvalidPriority,
    Cancelled,

    // res
    FileNotFound,
    PathNotFound,
    PathTooLong,
    FileSharingViolation,
    InvalidBufferSize,
    InvalidReadDivAlignment,
    InvalidFile,
    NullResourceFactory,
    FailedToAllocateFileMemory,

    // frm
    FailedToAllocateRootHeap,
    FailedToInitializeGfxContext,

    // resbui
    SectionExhaustion,
    EntryExhaustion,
    DuplicatePath,
    AlreadyLinked,
}

impl Code {
    pub const fn is_success(self) -> bool {
        matches!(self, Code::Success)
    }
}

/// A 32-bit tagged result code: `(module, code)`. `Success` is the only
/// value considered non-error regardless of module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode {
    pub module: Module,
    pub code: Code,
}

impl ResultCode {
    pub const fn new(module: Module, code: Code) -> Self {
        Self { module, code }
    }

    pub fn success(module: Module) -> Self {
        Self::new(module, Code::Success)
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{:?}", self.module, self.code)
    }
}

impl std::error::Error for ResultCode {}

/// Convenience alias: the runtime's fallible operations return
/// `Result<T>`, i.e. `Result<T, ResultCode>` — checkable by the caller,
/// never boxed, per's propagation policy.
pub type Result<T> = std::result::Result<T, ResultCode>;

/// Constructs a failing `Result<T>` for a given module/code pair.
#[macro_export]
macro_rules! result_err {
    ($module:expr, $code:expr) => {
        Err($crate::glue::result::ResultCode::new($module, $code))
    };
}

/// `RESULT_ABORT_UNLESS(cond, message)` —: "reserved for conditions
/// the surrounding code has statically established as impossible." This is
/// how inconsistent-state invariant violations (double free, lock released
/// by a non-owner, handle-table overflow that "cannot happen") are
/// surfaced: the process aborts with the failure site and the code.
#[macro_export]
macro_rules! result_abort_unless {
    ($cond:expr, $code:expr) => {
        if !($cond) {
            panic!(
                "RESULT_ABORT_UNLESS failed at {}:{}: {} ({})",
                file!(),
                line!(),
                stringify!($cond),
                $code
            );
        }
    };
}

pub use {result_abort_unless, result_err};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_only_code_considered_ok() {
        let ok = ResultCode::success(Module::Async);
        assert!(ok.is_success());
        let err = ResultCode::new(Module::Async, Code::Incomplete);
        assert!(err.is_failure());
    }

    #[test]
    fn display_includes_module_and_code() {
        let rc = ResultCode::new(Module::Res, Code::FileNotFound);
        assert_eq!(format!("{rc}"), "res::FileNotFound");
    }
}
