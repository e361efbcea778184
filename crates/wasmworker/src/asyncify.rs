//! # Async Call Bridge
//!
//! Lets a module compiled with asyncify call a host import whose result is
//! only available asynchronously, while the module itself sees an ordinary
//! synchronous call.
//!
//! ## Protocol
//!
//! 1. The driver (`AsyncCallState::call`) invokes an export.
//! 2. A wrapped import returns `ImportResult::Deferred`. The wrapper parks the
//!    future and tells the module to unwind its stack into the data region;
//!    the export returns early with a meaningless value.
//! 3. The driver stops the unwind, awaits the future outside the module,
//!    stores the value as the pending result, starts a rewind and calls the
//!    same export with the same arguments.
//! 4. The module replays its stack up to the import. The wrapper sees the
//!    continuation, stops the rewind and returns the pending result.
//! 5. Steps 2 to 4 repeat for every suspension; then the state is cleared.
//!
//! ## Invariants
//!
//! - At most one suspended invocation per instance.
//! - A top-level call may only start from `Phase::Idle`.
//! - Misuse of the protocol poisons the instance; nothing is retried.
//! - A driven call that fails leaves the module in normal mode with an empty
//!   data region, or poisons it when that cannot be restored.

use futures::future::BoxFuture;

use crate::store;

pub const START_UNWIND: &str = "asyncify_start_unwind";
pub const STOP_UNWIND: &str = "asyncify_stop_unwind";
pub const START_REWIND: &str = "asyncify_start_rewind";
pub const STOP_REWIND: &str = "asyncify_stop_rewind";

/// A value computed by the host on behalf of a suspended import.
/// `None` means "no data".
pub type HostValue = Option<Vec<u8>>;

/// The in-flight host operation.
pub type Deferred = BoxFuture<'static, store::Result<HostValue>>;

/// What a raw import produced.
pub enum ImportResult {
    Ready(u32),
    Deferred(Deferred),
}

/// The view of the call state handed to a raw import.
#[derive(Debug)]
pub struct AsyncFnState {
    /// `true` when this invocation is the resumed counterpart of a suspension.
    pub continuation: bool,
    /// The resolved host value; only meaningful when `continuation` is set.
    pub result: HostValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No top-level call in flight.
    Idle,
    /// An export is executing fresh.
    Running,
    /// The module has unwound; the host operation is being awaited.
    AwaitingHost,
    /// The export is being replayed towards the suspended import.
    Resuming,
    /// The protocol was violated; the instance cannot be used again.
    Poisoned,
}

#[derive(Debug)]
pub enum Error {
    /// A suspension was attempted but the data region was never set up.
    NotInitialized,
    /// A top-level call was made while another was still in flight.
    CallInFlight { export: String, phase: Phase },
    /// An import tried to suspend while a suspension was already outstanding.
    AlreadySuspended { import: &'static str, outstanding: &'static str },
    /// A resumed import found no pending result.
    MissingResult { import: &'static str },
    /// The replay reached a different import than the one that suspended.
    ImportMismatch { expected: &'static str, found: &'static str },
    /// An import returned a deferred value while being resumed.
    DeferredOnResume { import: &'static str },
    /// An import wanted to suspend during a call the bridge is not driving.
    NotDriven { import: &'static str },
    /// The replayed export returned without consuming the pending result.
    ResultNotConsumed { export: String },
    /// The instance was poisoned by an earlier violation.
    Poisoned,
    /// The host operation failed.
    Host(store::Error),
    /// The module trapped or an export was unusable.
    Module(wasmtime::Error),
}

impl Error {
    /// Whether this error leaves the instance unusable.
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadySuspended { .. }
                | Self::MissingResult { .. }
                | Self::ImportMismatch { .. }
                | Self::DeferredOnResume { .. }
                | Self::ResultNotConsumed { .. }
                | Self::Poisoned
        )
    }

    /// Recovers a bridge error that travelled through a wasm trap.
    pub(crate) fn from_trap(e: wasmtime::Error) -> Self {
        match e.downcast::<Error>() {
            Ok(err) => err,
            Err(e) => Self::Module(e),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "asyncify data region not initialized"),
            Self::CallInFlight { export, phase } => {
                write!(f, "can only handle one async call at a time: {} (bridge is {:?})", export, phase)
            }
            Self::AlreadySuspended { import, outstanding } => {
                write!(f, "{} tried to suspend while {} is already suspended", import, outstanding)
            }
            Self::MissingResult { import } => write!(f, "{} resumed without a pending result", import),
            Self::ImportMismatch { expected, found } => {
                write!(f, "resumed through {} but {} suspended", found, expected)
            }
            Self::DeferredOnResume { import } => write!(f, "{} deferred again while resuming", import),
            Self::NotDriven { import } => {
                write!(f, "{} needs to suspend but the call was not made through the async driver", import)
            }
            Self::ResultNotConsumed { export } => {
                write!(f, "{} returned without consuming the pending result", export)
            }
            Self::Poisoned => write!(f, "instance poisoned by an earlier protocol violation"),
            Self::Host(e) => write!(f, "host operation failed: {}", e),
            Self::Module(e) => write!(f, "module error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        Self::Host(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The module-side primitives the bridge drives.
///
/// Implemented over a wasmtime `Store` for top-level calls and over a
/// `Caller` inside imports.
pub trait Host {
    fn read_bytes(&mut self, start: u32, end: u32) -> wasmtime::Result<Vec<u8>>;

    fn write_bytes(&mut self, bytes: &[u8], offset: u32) -> wasmtime::Result<()>;

    /// Current size of linear memory in bytes.
    fn memory_size(&mut self) -> usize;

    /// Calls an export with i32 arguments; void exports return 0.
    fn call(&mut self, export: &str, args: &[u32]) -> wasmtime::Result<u32>;

    fn bridge(&mut self) -> &mut AsyncCallState;
}

struct Suspended {
    import: &'static str,
    deferred: Deferred,
}

/// Per-instance suspend/resume state.
pub struct AsyncCallState {
    phase: Phase,
    data_addr: Option<u32>,
    data_end: u32,
    continuation: bool,
    pending: Option<HostValue>,
    import_slot: Option<&'static str>,
    suspended: Option<Suspended>,
    export: Option<String>,
}

impl AsyncCallState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            data_addr: None,
            data_end: 0,
            continuation: false,
            pending: None,
            import_slot: None,
            suspended: None,
            export: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn continuation(&self) -> bool {
        self.continuation
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The import that triggered the current suspension, if any.
    pub fn import_slot(&self) -> Option<&'static str> {
        self.import_slot
    }

    pub fn data_addr(&self) -> Option<u32> {
        self.data_addr
    }

    /// Allocates the unwind region inside the module.
    ///
    /// The first two words of the region are the start and end of the space
    /// the module may unwind into.
    pub fn init<H: Host>(host: &mut H, malloc: &str, size: u32) -> Result<()> {
        let addr = host.call(malloc, &[size]).map_err(Error::Module)?;
        if addr == 0 {
            return Err(Error::Module(wasmtime::Error::msg("failed to allocate asyncify data")));
        }
        let end = addr
            .checked_add(size)
            .ok_or_else(|| Error::Module(wasmtime::Error::msg("asyncify data overflows memory")))?;
        write_header(host, addr, end).map_err(Error::Module)?;
        let bridge = host.bridge();
        bridge.data_addr = Some(addr);
        bridge.data_end = end;
        tracing::debug!(addr, size, "asyncify data region initialized");
        Ok(())
    }

    /// Frees the unwind region.
    pub fn release<H: Host>(host: &mut H, free: &str) -> Result<()> {
        if let Some(addr) = host.bridge().data_addr.take() {
            host.call(free, &[addr]).map_err(Error::Module)?;
        }
        Ok(())
    }

    /// Calls an export that may suspend, driving it to completion.
    ///
    /// This is the only sanctioned way to invoke such an export. If the
    /// returned future is dropped mid-flight the instance stays busy and every
    /// later call fails with `CallInFlight`.
    pub async fn call<H: Host + Send>(host: &mut H, export: &str, args: &[u32]) -> Result<u32> {
        host.bridge().begin(export)?;
        let outcome = Self::drive(host, export, args).await;
        if outcome.is_err() {
            Self::recover(host);
        }
        host.bridge().finish();
        outcome
    }

    /// Takes the module out of unwind or rewind mode after a failed call and
    /// empties the data region, so the frames of the abandoned stack are not
    /// carried into the next suspension.
    fn recover<H: Host>(host: &mut H) {
        let bridge = host.bridge();
        if bridge.phase == Phase::Poisoned {
            return;
        }
        let unwinding = bridge.suspended.take().is_some();
        let rewinding = bridge.continuation;
        let region = bridge.data_addr.map(|addr| (addr, bridge.data_end));

        if let Err(e) = restore(host, unwinding, rewinding, region) {
            host.bridge().poison(Error::Module(e));
        }
    }

    async fn drive<H: Host + Send>(host: &mut H, export: &str, args: &[u32]) -> Result<u32> {
        let mut result = host.call(export, args).map_err(Error::from_trap)?;

        loop {
            let Some(suspended) = host.bridge().suspended.take() else {
                break;
            };
            host.call(STOP_UNWIND, &[]).map_err(Error::Module)?;
            host.bridge().phase = Phase::AwaitingHost;
            tracing::debug!(export, import = suspended.import, "suspended, awaiting host");

            let value = suspended.deferred.await?;

            let data_addr = host.bridge().resume_with(value)?;
            host.call(START_REWIND, &[data_addr]).map_err(Error::Module)?;
            result = host.call(export, args).map_err(Error::from_trap)?;

            let bridge = host.bridge();
            if bridge.continuation {
                return Err(bridge.poison(Error::ResultNotConsumed { export: export.to_string() }));
            }
            tracing::debug!(export, "resumed");
        }

        Ok(result)
    }

    /// Runs a raw import under the protocol.
    ///
    /// On a fresh call `raw` runs its prelude and may defer; on the resumed
    /// call it receives the pending result and must produce a value.
    pub fn wrap_import<H, F>(host: &mut H, import: &'static str, raw: F) -> wasmtime::Result<u32>
    where
        H: Host,
        F: FnOnce(&mut H, AsyncFnState) -> wasmtime::Result<ImportResult>,
    {
        let bridge = host.bridge();
        if bridge.phase == Phase::Poisoned {
            return Err(Error::Poisoned.into());
        }
        if let Some(outstanding) = &bridge.suspended {
            let err = Error::AlreadySuspended { import, outstanding: outstanding.import };
            return Err(bridge.poison(err).into());
        }

        if bridge.continuation {
            host.call(STOP_REWIND, &[])?;
            let result = host.bridge().take_pending(import)?;
            return match raw(host, AsyncFnState { continuation: true, result })? {
                ImportResult::Ready(value) => Ok(value),
                ImportResult::Deferred(_) => {
                    Err(host.bridge().poison(Error::DeferredOnResume { import }).into())
                }
            };
        }

        match raw(host, AsyncFnState { continuation: false, result: None })? {
            ImportResult::Ready(value) => Ok(value),
            ImportResult::Deferred(deferred) => {
                let bridge = host.bridge();
                if bridge.phase != Phase::Running {
                    return Err(Error::NotDriven { import }.into());
                }
                let data_addr = bridge.data_addr.ok_or(Error::NotInitialized)?;
                bridge.suspended = Some(Suspended { import, deferred });
                bridge.import_slot = Some(import);
                host.call(START_UNWIND, &[data_addr])?;
                Ok(0)
            }
        }
    }

    fn begin(&mut self, export: &str) -> Result<()> {
        match self.phase {
            Phase::Idle => {}
            Phase::Poisoned => return Err(Error::Poisoned),
            phase => {
                return Err(Error::CallInFlight { export: export.to_string(), phase });
            }
        }
        self.phase = Phase::Running;
        self.continuation = false;
        self.pending = None;
        self.import_slot = None;
        self.export = Some(export.to_string());
        Ok(())
    }

    fn resume_with(&mut self, value: HostValue) -> Result<u32> {
        let data_addr = self.data_addr.ok_or(Error::NotInitialized)?;
        self.pending = Some(value);
        self.continuation = true;
        self.phase = Phase::Resuming;
        Ok(data_addr)
    }

    fn take_pending(&mut self, import: &'static str) -> Result<HostValue> {
        if let Some(expected) = self.import_slot {
            if expected != import {
                return Err(self.poison(Error::ImportMismatch { expected, found: import }));
            }
        }
        let Some(result) = self.pending.take() else {
            return Err(self.poison(Error::MissingResult { import }));
        };
        self.continuation = false;
        self.import_slot = None;
        self.phase = Phase::Running;
        Ok(result)
    }

    fn finish(&mut self) {
        if self.phase == Phase::Poisoned {
            return;
        }
        self.phase = Phase::Idle;
        self.continuation = false;
        self.pending = None;
        self.import_slot = None;
        self.suspended = None;
        self.export = None;
    }

    fn poison(&mut self, err: Error) -> Error {
        tracing::error!(export = ?self.export, error = %err, "asyncify protocol violated");
        self.phase = Phase::Poisoned;
        self.suspended = None;
        self.pending = None;
        err
    }
}

fn write_header<H: Host>(host: &mut H, addr: u32, end: u32) -> wasmtime::Result<()> {
    host.write_bytes(&(addr + 8).to_le_bytes(), addr)?;
    host.write_bytes(&end.to_le_bytes(), addr + 4)
}

fn restore<H: Host>(
    host: &mut H,
    unwinding: bool,
    rewinding: bool,
    region: Option<(u32, u32)>,
) -> wasmtime::Result<()> {
    if unwinding {
        host.call(STOP_UNWIND, &[])?;
    }
    if rewinding {
        host.call(STOP_REWIND, &[])?;
    }
    if let Some((addr, end)) = region {
        write_header(host, addr, end)?;
    }
    Ok(())
}

impl Default for AsyncCallState {
    fn default() -> Self {
        Self::new()
    }
}
