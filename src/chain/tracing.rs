//! Tracer hooks and the revm inspector that drives them.
//!
//! Tracers observe a geth-style hook stream: `on_tx_start`, `on_enter` per call
//! frame, `on_step` per opcode, `on_exit` per frame, `on_tx_end`. The
//! [`TracerStack`] adapts revm's `Inspector` callbacks into that stream and fans
//! it out to every attached tracer; tracers are independent and never observe
//! each other.

use alloy::primitives::{Address, U256};
use revm::{
    interpreter::{CallInputs, CallOutcome, CreateInputs, CreateOutcome, Interpreter},
    Database, EvmContext, Inspector,
};

use super::results::MessageResults;

/// Read-only access to chain state from inside a hook, independent of the
/// inspector's database type. Oracles use it for balance and storage probes.
pub trait StateView {
    fn storage(&mut self, address: Address, slot: U256) -> U256;
    fn balance(&mut self, address: Address) -> U256;
}

struct EvmStateView<'a, DB: Database> {
    context: &'a mut EvmContext<DB>,
}

impl<DB: Database> StateView for EvmStateView<'_, DB> {
    fn storage(&mut self, address: Address, slot: U256) -> U256 {
        self.context
            .inner
            .sload(address, slot)
            .map(|(value, _)| value)
            .unwrap_or_default()
    }

    fn balance(&mut self, address: Address) -> U256 {
        self.context
            .inner
            .balance(address)
            .map(|(value, _)| value)
            .unwrap_or_default()
    }
}

/// Frame-entry context handed to `on_enter`.
#[derive(Clone, Debug)]
pub struct FrameStart {
    /// Depth of the frame being entered; 0 is the top-level message frame.
    pub depth: usize,
    /// Whether the frame executes init bytecode (`CREATE`/`CREATE2`).
    pub create: bool,
    pub from: Address,
    /// Storage context of the frame. For create frames this is resolved at the
    /// first executed opcode.
    pub to: Address,
    /// Address owning the executing bytecode (differs from `to` under
    /// `DELEGATECALL`/`CALLCODE`).
    pub code_address: Address,
    pub value: U256,
    pub gas_limit: u64,
}

/// Frame-exit context handed to `on_exit`.
#[derive(Clone, Copy, Debug)]
pub struct FrameExit {
    /// Depth of the frame that just exited; 0 is the top-level frame.
    pub depth: usize,
    /// Whether the frame reverted or halted exceptionally. A reverted frame
    /// must contribute nothing to its parent.
    pub reverted: bool,
}

/// Per-opcode context handed to `on_step`, captured before the instruction
/// executes (operands are still on the stack).
pub struct StepScope<'a> {
    pub pc: u64,
    pub opcode: u8,
    /// Depth of the executing frame.
    pub depth: usize,
    /// Whether the executing code is init bytecode.
    pub create: bool,
    /// The executing bytecode.
    pub code: &'a [u8],
    pub code_address: Address,
    pub storage_address: Address,
    /// Operand stack, bottom to top.
    pub stack: &'a [U256],
    /// Current frame memory.
    pub memory: &'a [u8],
}

impl StepScope<'_> {
    /// The n-th stack operand counting from the top (0 = top).
    pub fn stack_back(&self, n: usize) -> Option<U256> {
        let len = self.stack.len();
        (n < len).then(|| self.stack[len - 1 - n])
    }

    /// A bounds-checked memory slice; `None` when out of range.
    pub fn memory_slice(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let offset = usize::try_from(offset).ok()?;
        let len = usize::try_from(len).ok()?;
        let end = offset.checked_add(len)?;
        self.memory.get(offset..end)
    }
}

/// A transaction observer. All hooks default to no-ops so tracers implement
/// only what they need.
pub trait Tracer: Send {
    fn on_tx_start(&mut self) {}
    fn on_enter(&mut self, _frame: &FrameStart) {}
    fn on_step(&mut self, _step: &StepScope<'_>, _state: &mut dyn StateView) {}
    fn on_exit(&mut self, _exit: &FrameExit, _state: &mut dyn StateView) {}
    fn on_tx_end(&mut self, _results: &mut MessageResults) {}
}

#[derive(Clone, Copy, Debug)]
struct FrameInfo {
    create: bool,
    from: Address,
    to: Address,
    code_address: Address,
    /// Create frames learn their address at the first executed opcode.
    resolved: bool,
}

/// Fans interpreter hooks out to the attached tracers. One stack per worker;
/// hooks are invoked sequentially in interpreter order, so no tracer needs
/// internal locking.
#[derive(Default)]
pub struct TracerStack {
    tracers: Vec<Box<dyn Tracer>>,
    frames: Vec<FrameInfo>,
}

impl TracerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracers.push(tracer);
    }

    pub fn tracer_count(&self) -> usize {
        self.tracers.len()
    }

    pub(crate) fn begin_tx(&mut self) {
        self.frames.clear();
        for tracer in &mut self.tracers {
            tracer.on_tx_start();
        }
    }

    pub(crate) fn finish_tx(&mut self, results: &mut MessageResults) {
        assert!(
            self.frames.is_empty(),
            "tracer frame stack not empty at tx end: {} frame(s) left",
            self.frames.len()
        );
        for tracer in &mut self.tracers {
            tracer.on_tx_end(results);
        }
    }

    /// Drop partially collected frame state after an execution error that
    /// bypassed the frame-exit hooks.
    pub(crate) fn abort_tx(&mut self) {
        self.frames.clear();
    }

    fn enter_frame(
        &mut self,
        create: bool,
        from: Address,
        to: Address,
        code_address: Address,
        value: U256,
        gas_limit: u64,
    ) {
        let depth = self.frames.len();
        self.frames.push(FrameInfo {
            create,
            from,
            to,
            code_address,
            resolved: !create,
        });
        let frame = FrameStart {
            depth,
            create,
            from,
            to,
            code_address,
            value,
            gas_limit,
        };
        for tracer in &mut self.tracers {
            tracer.on_enter(&frame);
        }
    }

    fn exit_frame(&mut self, reverted: bool, state: &mut dyn StateView) {
        if self.frames.pop().is_none() {
            panic!("tracer frame stack underflow on frame exit");
        }
        let exit = FrameExit {
            depth: self.frames.len(),
            reverted,
        };
        for tracer in &mut self.tracers {
            tracer.on_exit(&exit, state);
        }
    }
}

impl<DB: Database> Inspector<DB> for TracerStack {
    fn step(&mut self, interpreter: &mut Interpreter, context: &mut EvmContext<DB>) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        if !frame.resolved {
            // Create frames: the interpreter now knows the deployment address.
            frame.resolved = true;
            frame.to = interpreter.contract.target_address;
            frame.code_address = interpreter.contract.target_address;
        }
        let frame = *frame;

        let step = StepScope {
            pc: interpreter.program_counter() as u64,
            opcode: interpreter.current_opcode(),
            depth: self.frames.len() - 1,
            create: frame.create,
            code: interpreter.contract.bytecode.original_byte_slice(),
            code_address: frame.code_address,
            storage_address: interpreter.contract.target_address,
            stack: interpreter.stack().data(),
            memory: interpreter.shared_memory.context_memory(),
        };
        let mut state = EvmStateView { context };
        for tracer in &mut self.tracers {
            tracer.on_step(&step, &mut state);
        }
    }

    fn call(
        &mut self,
        _context: &mut EvmContext<DB>,
        inputs: &mut CallInputs,
    ) -> Option<CallOutcome> {
        self.enter_frame(
            false,
            inputs.caller,
            inputs.target_address,
            inputs.bytecode_address,
            inputs.value.get(),
            inputs.gas_limit,
        );
        None
    }

    fn call_end(
        &mut self,
        context: &mut EvmContext<DB>,
        _inputs: &CallInputs,
        outcome: CallOutcome,
    ) -> CallOutcome {
        let reverted = !outcome.result.result.is_ok();
        let mut state = EvmStateView { context };
        self.exit_frame(reverted, &mut state);
        outcome
    }

    fn create(
        &mut self,
        _context: &mut EvmContext<DB>,
        inputs: &mut CreateInputs,
    ) -> Option<CreateOutcome> {
        // The created address is unknown until the frame starts executing; it is
        // resolved at the first opcode.
        self.enter_frame(
            true,
            inputs.caller,
            Address::ZERO,
            Address::ZERO,
            inputs.value,
            inputs.gas_limit,
        );
        None
    }

    fn create_end(
        &mut self,
        context: &mut EvmContext<DB>,
        _inputs: &CreateInputs,
        outcome: CreateOutcome,
    ) -> CreateOutcome {
        let reverted = !outcome.result.result.is_ok();
        let mut state = EvmStateView { context };
        self.exit_frame(reverted, &mut state);
        outcome
    }
}
