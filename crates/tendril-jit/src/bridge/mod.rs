//! Native/managed bridge
//!
//! Compiled code talks to the managed world through two C-ABI entry points:
//!
//! - [`tendril_call_managed`] performs a dynamic send on behalf of native
//!   code. Its arguments are a pointer to `count + 2` handle words
//!   (receiver, method name, then the arguments) and the argument count.
//! - [`tendril_continue_in_interpreter`] abandons native execution: it
//!   rebuilds interpreter state from the live native frame using a
//!   [`DeoptMap`] and finishes the method in the interpreter.
//!
//! Both return a handle word for the result. Neither may unwind into native
//! code, so on failure they park the error in the active [`Bridge`] and
//! return [`NULL_HANDLE`]; [`Bridge::call_native`] reports the parked error
//! once control is back on the managed side.

mod deopt;
mod handles;

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;

use tendril_vm::{Insn, Interpreter, Locals, RuntimeError, Value};
use tracing::debug;

pub use deopt::{read_frame, DeoptMap, DeoptObserver, FrameState};
pub use handles::{HandleTable, Managed, Word, NULL_HANDLE, WORD_BYTES};

/// Error crossing the native/managed boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Unknown handle {0:#x}")]
    UnknownHandle(Word),
    #[error("Handle {word:#x} names a {found}, expected a {expected}")]
    WrongKind {
        word: Word,
        expected: &'static str,
        found: &'static str,
    },
    #[error(transparent)]
    Dispatch(#[from] RuntimeError),
    #[error("Null pointer passed for {0}")]
    NullPointer(&'static str),
    #[error("Misaligned pointer {0:#x}")]
    Misaligned(Word),
    #[error("Invalid native frame [{sp:#x}, {fp:#x})")]
    InvalidFrame { fp: Word, sp: Word },
    #[error("Native frame holds {available} words but {needed} are needed")]
    FrameTooSmall { needed: usize, available: usize },
    #[error("Managed call needs a receiver and a method name, got {0} words")]
    TruncatedCall(usize),
    #[error("Native function takes {expected} arguments, got {given}")]
    NativeArity { expected: usize, given: usize },
    #[error("Handle table is full")]
    TableFull,
}

/// The interpreter a deoptimized method resumes in
pub trait Interpret {
    fn resume(
        &self,
        insns: &[Insn],
        receiver: Value,
        args: &[Value],
        resume_at: usize,
        stack: Vec<Value>,
        locals: Locals,
    ) -> Result<Value, RuntimeError>;
}

impl Interpret for Interpreter {
    fn resume(
        &self,
        insns: &[Insn],
        receiver: Value,
        args: &[Value],
        resume_at: usize,
        stack: Vec<Value>,
        locals: Locals,
    ) -> Result<Value, RuntimeError> {
        self.interpret(insns, receiver, args, None, resume_at, stack, locals)
    }
}

/// A native function the managed side can call with handle words
pub trait NativeFunction {
    fn invoke(&self, args: &[Word]) -> Result<Word, BridgeError>;
}

impl<F> NativeFunction for F
where
    F: Fn(&[Word]) -> Word,
{
    fn invoke(&self, args: &[Word]) -> Result<Word, BridgeError> {
        Ok(self(args))
    }
}

/// A C-ABI function taking and returning handle words
#[derive(Debug, Clone, Copy)]
pub enum NativeEntry {
    Arity0(extern "C" fn() -> Word),
    Arity1(extern "C" fn(Word) -> Word),
    Arity2(extern "C" fn(Word, Word) -> Word),
    Arity3(extern "C" fn(Word, Word, Word) -> Word),
}

impl NativeEntry {
    pub fn arity(&self) -> usize {
        match self {
            NativeEntry::Arity0(_) => 0,
            NativeEntry::Arity1(_) => 1,
            NativeEntry::Arity2(_) => 2,
            NativeEntry::Arity3(_) => 3,
        }
    }
}

impl NativeFunction for NativeEntry {
    fn invoke(&self, args: &[Word]) -> Result<Word, BridgeError> {
        match (*self, args) {
            (NativeEntry::Arity0(f), []) => Ok(f()),
            (NativeEntry::Arity1(f), &[a]) => Ok(f(a)),
            (NativeEntry::Arity2(f), &[a, b]) => Ok(f(a, b)),
            (NativeEntry::Arity3(f), &[a, b, c]) => Ok(f(a, b, c)),
            _ => Err(BridgeError::NativeArity { expected: self.arity(), given: args.len() }),
        }
    }
}

/// Bridge context: the handle table, the interpreter to resume in, and an
/// optional deoptimization observer
pub struct Bridge {
    handles: RefCell<HandleTable>,
    interpreter: Box<dyn Interpret>,
    observer: Option<Box<dyn DeoptObserver>>,
    pending: RefCell<Option<BridgeError>>,
}

thread_local! {
    static ACTIVE: Cell<*const Bridge> = const { Cell::new(std::ptr::null()) };
}

/// Keeps a bridge installed as the current thread's active bridge.
///
/// Dropping it reinstates whichever bridge was active before.
pub struct ActiveBridge<'b> {
    previous: *const Bridge,
    _bridge: PhantomData<&'b Bridge>,
}

impl Drop for ActiveBridge<'_> {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

impl Bridge {
    /// A bridge resuming deoptimized methods in the reference interpreter
    pub fn new() -> Self {
        Self::with_interpreter(Interpreter::new())
    }

    pub fn with_interpreter(interpreter: impl Interpret + 'static) -> Self {
        Bridge {
            handles: RefCell::new(HandleTable::new()),
            interpreter: Box::new(interpreter),
            observer: None,
            pending: RefCell::new(None),
        }
    }

    pub fn with_observer(mut self, observer: impl DeoptObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Number of live handles
    pub fn handle_count(&self) -> usize {
        self.handles.borrow().len()
    }

    /// Generation of the handle table, advanced by [`Bridge::reset`]
    pub fn handle_generation(&self) -> Word {
        self.handles.borrow().generation()
    }

    /// Handle word for a managed value
    pub fn to_native(&self, value: Value) -> Result<Word, BridgeError> {
        self.handles.borrow_mut().value_handle(value)
    }

    /// Managed value for a handle word
    pub fn to_managed(&self, word: Word) -> Result<Value, BridgeError> {
        self.handles.borrow().value(word)
    }

    /// Make a deopt map available to native code
    pub fn register_deopt_map(&self, map: DeoptMap) -> Result<Word, BridgeError> {
        self.handles.borrow_mut().deopt_map_handle(Arc::new(map))
    }

    /// Drop every handle issued so far
    pub fn reset(&self) {
        self.handles.borrow_mut().reset();
        self.pending.borrow_mut().take();
    }

    /// Dispatch a send described by handle words: receiver, method name,
    /// then the arguments
    pub fn call_managed(&self, words: &[Word]) -> Result<Word, BridgeError> {
        let &[receiver, name, ref args @ ..] = words else {
            return Err(BridgeError::TruncatedCall(words.len()));
        };

        let receiver = self.to_managed(receiver)?;
        let name = self.to_managed(name)?;
        let name = name
            .as_symbol()
            .ok_or(RuntimeError::NotASymbol(name.kind()))?;
        let args = args
            .iter()
            .map(|&word| self.to_managed(word))
            .collect::<Result<Vec<_>, _>>()?;

        let result = receiver.send(name, &args)?;
        self.to_native(result)
    }

    /// Finish a method in the interpreter from the words of its native
    /// frame, `frame[0]` being the word at the stack pointer
    pub fn continue_in_interpreter(&self, frame: &[Word], map: Word) -> Result<Word, BridgeError> {
        let map = self.handles.borrow().deopt_map(map)?;
        let state = read_frame(&self.handles.borrow(), &map, frame)?;

        if let Some(observer) = &self.observer {
            observer.on_deopt(&map, &state);
        }
        debug!(ip = map.ip, stack = state.stack.len(), args = state.args.len(), "resuming in interpreter");

        let FrameState { receiver, args, stack, locals } = state;
        let result = self.interpreter.resume(&map.insns, receiver, &args, map.ip, stack, locals)?;
        self.to_native(result)
    }

    /// Install this bridge as the one the raw entry points use on this
    /// thread, until the returned guard is dropped
    pub fn enter(&self) -> ActiveBridge<'_> {
        let previous = ACTIVE.with(|active| active.replace(self as *const Bridge));
        ActiveBridge { previous, _bridge: PhantomData }
    }

    /// Call a native function with managed arguments.
    ///
    /// The arguments are passed as handle words and the returned word is
    /// converted back. The bridge is active for the duration of the call,
    /// so the function may call back through the raw entry points; an error
    /// raised there is returned here.
    pub fn call_native(
        &self,
        function: &dyn NativeFunction,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        let words = args
            .iter()
            .map(|arg| self.to_native(arg.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let result = {
            let _active = self.enter();
            function.invoke(&words)
        };

        if let Some(error) = self.pending.borrow_mut().take() {
            return Err(error);
        }
        self.to_managed(result?)
    }

    /// Turn a result into a word for native code, parking any error
    fn settle(&self, result: Result<Word, BridgeError>) -> Word {
        match result {
            Ok(word) => word,
            Err(error) => {
                debug!(%error, "parking bridge error");
                self.pending.borrow_mut().get_or_insert(error);
                NULL_HANDLE
            }
        }
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("handles", &self.handles.borrow().len())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// The bridge installed by [`Bridge::enter`] on this thread.
///
/// # Safety
/// The returned reference is only valid while the [`ActiveBridge`] guard
/// that installed it is alive, which covers any native call made under it.
unsafe fn active_bridge<'a>() -> Option<&'a Bridge> {
    let bridge = ACTIVE.with(Cell::get);
    bridge.as_ref()
}

/// Borrow `count` words starting at `pointer`.
///
/// # Safety
/// `pointer` must address `count` readable words that outlive the borrow.
unsafe fn words_at<'a>(pointer: Word, count: usize) -> Result<&'a [Word], BridgeError> {
    if pointer == 0 {
        return Err(BridgeError::NullPointer("words"));
    }
    if pointer % std::mem::align_of::<Word>() != 0 {
        return Err(BridgeError::Misaligned(pointer));
    }
    Ok(std::slice::from_raw_parts(pointer as *const Word, count))
}

/// The words of a native frame, from the stack pointer up to (not
/// including) the frame pointer
///
/// # Safety
/// `[sp, fp)` must be readable memory that outlives the borrow.
unsafe fn frame_words<'a>(fp: Word, sp: Word) -> Result<&'a [Word], BridgeError> {
    if fp == 0 || sp == 0 {
        return Err(BridgeError::NullPointer("frame"));
    }
    if fp < sp || (fp - sp) % WORD_BYTES != 0 {
        return Err(BridgeError::InvalidFrame { fp, sp });
    }
    words_at(sp, (fp - sp) / WORD_BYTES)
}

/// Dynamic send from native code
///
/// # Arguments
/// * `args_pointer` - Address of `args_count + 2` handle words: receiver,
///   method name, then the arguments
/// * `args_count` - Number of arguments
///
/// # Returns
/// * Handle of the result, or `NULL_HANDLE` on failure
///
/// # Safety
/// - Must be called while a bridge is active on this thread
/// - `args_pointer` must address `args_count + 2` readable words
#[no_mangle]
pub unsafe extern "C" fn tendril_call_managed(args_pointer: Word, args_count: Word) -> Word {
    let Some(bridge) = active_bridge() else {
        return NULL_HANDLE;
    };
    let result = match args_count.checked_add(2) {
        Some(count) => words_at(args_pointer, count).and_then(|words| bridge.call_managed(words)),
        None => Err(BridgeError::TruncatedCall(args_count)),
    };
    bridge.settle(result)
}

/// Deoptimize: finish the current method in the interpreter
///
/// # Arguments
/// * `frame_pointer` - End of the live native frame
/// * `stack_pointer` - Start of the live native frame (most recent word)
/// * `deopt_map` - Handle of the method's `DeoptMap`
///
/// # Returns
/// * Handle of the method's result, or `NULL_HANDLE` on failure
///
/// # Safety
/// - Must be called while a bridge is active on this thread
/// - `[stack_pointer, frame_pointer)` must be readable memory
#[no_mangle]
pub unsafe extern "C" fn tendril_continue_in_interpreter(
    frame_pointer: Word,
    stack_pointer: Word,
    deopt_map: Word,
) -> Word {
    let Some(bridge) = active_bridge() else {
        return NULL_HANDLE;
    };
    let result = frame_words(frame_pointer, stack_pointer)
        .and_then(|frame| bridge.continue_in_interpreter(frame, deopt_map));
    bridge.settle(result)
}

/// Address native code calls for a dynamic send
pub fn call_managed_address() -> Word {
    tendril_call_managed as usize
}

/// Address native code calls to deoptimize
pub fn continue_in_interpreter_address() -> Word {
    tendril_continue_in_interpreter as usize
}

/// Symbol table for a code generator resolving the entry points by name
pub fn symbols() -> [(&'static str, Word); 2] {
    [
        ("tendril_call_managed", call_managed_address()),
        ("tendril_continue_in_interpreter", continue_in_interpreter_address()),
    ]
}
