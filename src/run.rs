//! The bytecode interpreter and the builtin module.
//!
//! Executes the in-memory instruction layout the loader produces: a token
//! dispatch loop over a word-oriented expression stack, a return stack of
//! (ip, env) frames, and an environment pointer. The execution context is
//! itself a `CanGC` capability: its stacks are traced conservatively, so
//! instructions like `alloc` and `make_closure` can trigger collection at
//! any allocation point.
//!
//! Builtins live in a synthetic `builtin` module registered before any
//! file is loaded. Each builtin is a real proc whose body is
//! `call_builtin n; ret`, so builtin closures obey the same invariants as
//! loaded ones.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;

use crate::closure::{alloc_closure, init_closure, Closure};
use crate::code::{write_instr, Immediate, Opcode};
use crate::data::{FlatString, Width};
use crate::errors::ExecError;
use crate::heap::capability::{
    abort_oom, chain_can_gc, CapabilityMode, GcCapability, GcTracer, NoGcScope,
};
use crate::heap::layout::WORD_SIZE;
use crate::heap::{Heap, MarkState};
use crate::library::{EntrySignature, Library, LibraryLoading};
use crate::machine::Machine;

/// A saved call frame: where to resume, and with which environment.
#[derive(Clone, Copy)]
struct Frame {
    ip: *const u8,
    env: *mut u8,
}

/// Interpreter state. Stack slots are 64-bit regardless of word size;
/// pointers occupy the low bits and are traced by masking back down.
pub struct Context<'p> {
    parent: &'p dyn GcCapability,
    expr: RefCell<Vec<u64>>,
    rstack: RefCell<Vec<Frame>>,
    ip: Cell<*const u8>,
    env: Cell<*mut u8>,
}

impl<'p> Context<'p> {
    pub fn new(parent: &'p dyn GcCapability) -> Context<'p> {
        Context {
            parent,
            expr: RefCell::new(Vec::new()),
            rstack: RefCell::new(Vec::new()),
            ip: Cell::new(std::ptr::null()),
            env: Cell::new(std::ptr::null_mut()),
        }
    }

    fn push(&self, value: u64) {
        self.expr.borrow_mut().push(value);
    }

    fn pop(&self) -> Result<u64, ExecError> {
        self.expr.borrow_mut().pop().ok_or(ExecError::StackUnderflow)
    }

    fn depth(&self) -> usize {
        self.expr.borrow().len()
    }
}

impl GcCapability for Context<'_> {
    fn heap(&self) -> &Heap {
        self.parent.heap()
    }

    fn mode(&self) -> CapabilityMode {
        CapabilityMode::CanGc
    }

    fn can_gc(&self) -> bool {
        chain_can_gc(self.parent)
    }

    fn trace_for_gc(&self, state: &mut MarkState<'_>) {
        for value in self.expr.borrow().iter() {
            state.mark_root(*value as usize);
        }
        for frame in self.rstack.borrow().iter() {
            state.mark_root(frame.ip as usize);
            state.mark_root(frame.env as usize);
        }
        state.mark_root(self.ip.get() as usize);
        state.mark_root(self.env.get() as usize);
        self.parent.trace_for_gc(state);
    }

    fn oom(&self, size_bytes: usize) {
        abort_oom(size_bytes);
    }
}

/// Unaligned reads from the instruction stream.
struct Decoder {
    pc: *const u8,
}

impl Decoder {
    fn u8(&mut self) -> u8 {
        // SAFETY: the loader sized the code buffer for every operand it
        // wrote; pc never outruns a well-formed stream.
        let v = unsafe { self.pc.read() };
        self.pc = unsafe { self.pc.add(1) };
        v
    }

    fn u16(&mut self) -> u16 {
        let v = unsafe { (self.pc as *const u16).read_unaligned() };
        self.pc = unsafe { self.pc.add(2) };
        v
    }

    fn u32(&mut self) -> u32 {
        let v = unsafe { (self.pc as *const u32).read_unaligned() };
        self.pc = unsafe { self.pc.add(4) };
        v
    }

    fn u64(&mut self) -> u64 {
        let v = unsafe { (self.pc as *const u64).read_unaligned() };
        self.pc = unsafe { self.pc.add(8) };
        v
    }

    fn word(&mut self) -> usize {
        let v = unsafe { (self.pc as *const usize).read_unaligned() };
        self.pc = unsafe { self.pc.add(WORD_SIZE) };
        v
    }

    fn width(&mut self) -> Result<Width, ExecError> {
        Width::try_from(self.u8()).map_err(|_| ExecError::CorruptCode)
    }
}

/// All-ones mask for the given width.
fn width_mask(width: Width) -> u64 {
    match width {
        Width::W8 => 0xFF,
        Width::W16 => 0xFFFF,
        Width::W32 => 0xFFFF_FFFF,
        Width::W64 => u64::MAX,
        Width::Fast | Width::Ptr => usize::MAX as u64,
    }
}

/// Interprets the low `width` bits of `value` as signed and extends.
fn sign_extend(width: Width, value: u64) -> i64 {
    match width {
        Width::W8 => value as u8 as i8 as i64,
        Width::W16 => value as u16 as i16 as i64,
        Width::W32 => value as u32 as i32 as i64,
        Width::W64 => value as i64,
        Width::Fast | Width::Ptr => value as usize as isize as i64,
    }
}

/// Runs a library's entry closure. For the `Args` signature the command
/// line is passed as an argument count plus a heap array of flat strings.
pub fn run(machine: &Machine, library: &Library, args: &[String]) -> Result<i32, ExecError> {
    let Some((signature, closure)) = library.entry_closure() else {
        return Err(ExecError::NoEntryClosure);
    };

    let root = machine.root();
    let ctx = Context::new(&root);

    if signature == EntrySignature::Args {
        let tracer = GcTracer::new(&root);
        let argv: *mut u8 = tracer.alloc_bytes(args.len().max(1) * WORD_SIZE);
        tracer.add_root(&argv);
        for (i, arg) in args.iter().enumerate() {
            let Some(string) = FlatString::alloc(&tracer, arg.len()) else {
                // A CanGC scope aborts on allocation failure.
                unreachable!()
            };
            // SAFETY: the string buffer holds arg.len() bytes; argv holds
            // one word per argument.
            unsafe {
                std::ptr::copy_nonoverlapping(arg.as_ptr(), string.buffer(), arg.len());
                (argv as *mut usize).add(i).write(string.ptr() as usize);
            }
        }
        ctx.push(args.len() as u64);
        ctx.push(argv as usize as u64);
        tracer.remove_root(&argv);
    }

    // SAFETY: the closure cell was initialised by the loader.
    unsafe {
        ctx.ip.set((*closure).code);
        ctx.env.set((*closure).data);
    }

    let exit_code = execute(&ctx);
    std::io::stdout().flush().ok();
    exit_code
}

fn execute(ctx: &Context<'_>) -> Result<i32, ExecError> {
    loop {
        let mut decoder = Decoder { pc: ctx.ip.get() };
        let opcode_byte = decoder.u8();
        let opcode = Opcode::try_from(opcode_byte).map_err(|_| ExecError::BadOpcode(opcode_byte))?;

        let mut width1 = None;
        let mut width2 = None;
        if opcode.num_width_bytes() > 0 {
            width1 = Some(decoder.width()?);
            if opcode.num_width_bytes() > 1 {
                width2 = Some(decoder.width()?);
            }
        }

        match opcode {
            Opcode::LoadImmNum => {
                let width = width1.ok_or(ExecError::CorruptCode)?;
                let value = decoder.u32() as u64;
                ctx.push(value & width_mask(width));
            }
            Opcode::LoadImm8 => {
                let value = decoder.u8();
                ctx.push(value as u64);
            }
            Opcode::LoadImm16 => {
                let value = decoder.u16();
                ctx.push(value as u64);
            }
            Opcode::LoadImm32 => {
                let value = decoder.u32();
                ctx.push(value as u64);
            }
            Opcode::LoadImm64 => {
                let value = decoder.u64();
                ctx.push(value);
            }

            Opcode::Ze => {
                let from = width1.ok_or(ExecError::CorruptCode)?;
                let to = width2.ok_or(ExecError::CorruptCode)?;
                let value = ctx.pop()?;
                ctx.push(value & width_mask(from) & width_mask(to));
            }
            Opcode::Se => {
                let from = width1.ok_or(ExecError::CorruptCode)?;
                let to = width2.ok_or(ExecError::CorruptCode)?;
                let value = ctx.pop()?;
                ctx.push(sign_extend(from, value) as u64 & width_mask(to));
            }
            Opcode::Trunc => {
                let to = width2.ok_or(ExecError::CorruptCode)?;
                let value = ctx.pop()?;
                ctx.push(value & width_mask(to));
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Lshift
            | Opcode::Rshift
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::LtU
            | Opcode::LtS
            | Opcode::GtU
            | Opcode::GtS
            | Opcode::Eq => {
                let width = width1.ok_or(ExecError::CorruptCode)?;
                let mask = width_mask(width);
                let b = ctx.pop()? & mask;
                let a = ctx.pop()? & mask;
                let result = match opcode {
                    Opcode::Add => a.wrapping_add(b),
                    Opcode::Sub => a.wrapping_sub(b),
                    Opcode::Mul => a.wrapping_mul(b),
                    Opcode::Div => {
                        if b == 0 {
                            return Err(ExecError::DivisionByZero);
                        }
                        sign_extend(width, a).wrapping_div(sign_extend(width, b)) as u64
                    }
                    Opcode::Mod => {
                        if b == 0 {
                            return Err(ExecError::DivisionByZero);
                        }
                        sign_extend(width, a).wrapping_rem(sign_extend(width, b)) as u64
                    }
                    Opcode::Lshift => a.wrapping_shl(b as u32),
                    Opcode::Rshift => a.wrapping_shr(b as u32),
                    Opcode::And => a & b,
                    Opcode::Or => a | b,
                    Opcode::Xor => a ^ b,
                    Opcode::LtU => (a < b) as u64,
                    Opcode::LtS => (sign_extend(width, a) < sign_extend(width, b)) as u64,
                    Opcode::GtU => (a > b) as u64,
                    Opcode::GtS => (sign_extend(width, a) > sign_extend(width, b)) as u64,
                    Opcode::Eq => (a == b) as u64,
                    _ => unreachable!(),
                };
                ctx.push(result & mask);
            }
            Opcode::Not => {
                let width = width1.ok_or(ExecError::CorruptCode)?;
                let value = ctx.pop()? & width_mask(width);
                ctx.push((value == 0) as u64);
            }

            Opcode::Drop => {
                ctx.pop()?;
            }
            Opcode::Dup => {
                let value = ctx.pop()?;
                ctx.push(value);
                ctx.push(value);
            }
            Opcode::Swap => {
                let b = ctx.pop()?;
                let a = ctx.pop()?;
                ctx.push(b);
                ctx.push(a);
            }
            Opcode::Roll => {
                let depth = decoder.u8() as usize;
                if depth > 1 {
                    if depth > ctx.depth() {
                        return Err(ExecError::StackUnderflow);
                    }
                    let mut expr = ctx.expr.borrow_mut();
                    let index = expr.len() - depth;
                    let value = expr.remove(index);
                    expr.push(value);
                }
            }
            Opcode::Pick => {
                let depth = decoder.u8() as usize;
                if depth == 0 || depth > ctx.depth() {
                    return Err(ExecError::StackUnderflow);
                }
                let value = {
                    let expr = ctx.expr.borrow();
                    expr[expr.len() - depth]
                };
                ctx.push(value);
            }

            Opcode::Call | Opcode::CallImport => {
                let closure = decoder.word() as *const Closure;
                ctx.rstack.borrow_mut().push(Frame {
                    ip: decoder.pc,
                    env: ctx.env.get(),
                });
                // SAFETY: call immediates are resolved closure cells.
                unsafe {
                    ctx.ip.set((*closure).code);
                    ctx.env.set((*closure).data);
                }
                continue;
            }
            Opcode::CallInd => {
                let closure = ctx.pop()? as usize as *const Closure;
                ctx.rstack.borrow_mut().push(Frame {
                    ip: decoder.pc,
                    env: ctx.env.get(),
                });
                // SAFETY: the mutator only pushes valid closure cells for
                // indirect calls.
                unsafe {
                    ctx.ip.set((*closure).code);
                    ctx.env.set((*closure).data);
                }
                continue;
            }
            Opcode::CallProc => {
                let code = decoder.word() as *const u8;
                ctx.rstack.borrow_mut().push(Frame {
                    ip: decoder.pc,
                    env: ctx.env.get(),
                });
                ctx.ip.set(code);
                continue;
            }
            Opcode::TCall | Opcode::TCallImport => {
                let closure = decoder.word() as *const Closure;
                // SAFETY: as for Call.
                unsafe {
                    ctx.ip.set((*closure).code);
                    ctx.env.set((*closure).data);
                }
                continue;
            }
            Opcode::TCallInd => {
                let closure = ctx.pop()? as usize as *const Closure;
                // SAFETY: as for CallInd.
                unsafe {
                    ctx.ip.set((*closure).code);
                    ctx.env.set((*closure).data);
                }
                continue;
            }
            Opcode::TCallProc => {
                let code = decoder.word() as *const u8;
                ctx.ip.set(code);
                continue;
            }

            Opcode::CJmp => {
                let width = width1.ok_or(ExecError::CorruptCode)?;
                let target = decoder.word() as *const u8;
                let cond = ctx.pop()? & width_mask(width);
                if cond != 0 {
                    ctx.ip.set(target);
                    continue;
                }
            }
            Opcode::Jmp => {
                let target = decoder.word() as *const u8;
                ctx.ip.set(target);
                continue;
            }
            Opcode::Ret => {
                let frame = ctx.rstack.borrow_mut().pop();
                match frame {
                    Some(frame) => {
                        ctx.ip.set(frame.ip);
                        ctx.env.set(frame.env);
                        continue;
                    }
                    // Returning from the entry closure ends the program;
                    // the stack top, if any, is the exit code.
                    None => {
                        let code = ctx.expr.borrow().last().copied().unwrap_or(0);
                        return Ok(code as i32);
                    }
                }
            }

            Opcode::Alloc => {
                let size_bytes = decoder.word();
                let cell = ctx.alloc_bytes(size_bytes);
                // Fresh cells start zeroed: stale words in a reused cell
                // must not masquerade as pointers or field values.
                // SAFETY: the cell is at least size_bytes long.
                unsafe { std::ptr::write_bytes(cell, 0, size_bytes) };
                ctx.push(cell as usize as u64);
            }
            Opcode::MakeClosure => {
                let code = decoder.word() as *mut u8;
                let data = ctx.pop()? as usize as *mut u8;
                // The environment left the expression stack; root it
                // across the allocation.
                let tracer = GcTracer::new(ctx);
                tracer.add_root(&data);
                let Some(closure) = alloc_closure(&tracer) else {
                    // A CanGC scope aborts on allocation failure.
                    unreachable!()
                };
                tracer.remove_root(&data);
                // SAFETY: a freshly allocated closure cell.
                unsafe { init_closure(closure, code, data) };
                ctx.push(closure as usize as u64);
            }
            Opcode::Load => {
                let width = width1.ok_or(ExecError::CorruptCode)?;
                let offset = decoder.u16() as usize;
                let base = ctx.pop()? as usize as *const u8;
                // SAFETY: field offsets were validated against the struct
                // layout at load time.
                let value = unsafe {
                    let slot = base.add(offset);
                    match width {
                        Width::W8 => slot.read() as u64,
                        Width::W16 => (slot as *const u16).read_unaligned() as u64,
                        Width::W32 => (slot as *const u32).read_unaligned() as u64,
                        Width::W64 => (slot as *const u64).read_unaligned(),
                        Width::Fast | Width::Ptr => {
                            (slot as *const usize).read_unaligned() as u64
                        }
                    }
                };
                ctx.push(value);
            }
            Opcode::Store => {
                let width = width1.ok_or(ExecError::CorruptCode)?;
                let offset = decoder.u16() as usize;
                let value = ctx.pop()?;
                let base = ctx.pop()? as usize as *mut u8;
                // SAFETY: as for Load.
                unsafe {
                    let slot = base.add(offset);
                    match width {
                        Width::W8 => slot.write(value as u8),
                        Width::W16 => (slot as *mut u16).write_unaligned(value as u16),
                        Width::W32 => (slot as *mut u32).write_unaligned(value as u32),
                        Width::W64 => (slot as *mut u64).write_unaligned(value),
                        Width::Fast | Width::Ptr => {
                            (slot as *mut usize).write_unaligned(value as usize)
                        }
                    }
                }
            }
            Opcode::LoadImport => {
                let offset = decoder.u16() as usize;
                let base = ctx.pop()? as usize as *const u8;
                // SAFETY: import offsets index an import-closure array the
                // environment provides.
                let value = unsafe { (base.add(offset) as *const usize).read_unaligned() };
                ctx.push(value as u64);
            }
            Opcode::GetEnv => {
                ctx.push(ctx.env.get() as usize as u64);
            }

            Opcode::CallBuiltin => {
                let id = decoder.u32();
                let builtin = BUILTINS
                    .get(id as usize)
                    .ok_or(ExecError::BadBuiltin(id))?;
                (builtin.run)(ctx)?;
            }
        }

        ctx.ip.set(decoder.pc);
    }
}

struct Builtin {
    name: &'static str,
    run: fn(&Context<'_>) -> Result<(), ExecError>,
}

/// The builtin table; `call_builtin` immediates index it.
static BUILTINS: &[Builtin] = &[
    Builtin {
        name: "print",
        run: builtin_print,
    },
    Builtin {
        name: "print_int",
        run: builtin_print_int,
    },
];

/// Pops a flat string and writes its bytes to stdout.
fn builtin_print(ctx: &Context<'_>) -> Result<(), ExecError> {
    let ptr = ctx.pop()? as usize as *mut u8;
    print!("{}", FlatString::from_ptr(ptr));
    Ok(())
}

/// Pops a word and prints it as a signed integer.
fn builtin_print_int(ctx: &Context<'_>) -> Result<(), ExecError> {
    let value = ctx.pop()?;
    print!("{}", value as i64);
    Ok(())
}

/// Builds the `builtin` module and registers it with the machine. Every
/// builtin becomes a proc (`call_builtin n; ret`), a closure over a null
/// environment, and an export named `builtin.<name>`.
pub fn setup_builtins(machine: &Machine) -> Rc<Library> {
    let root = machine.root();
    let num = BUILTINS.len() as u32;

    let lib_load = {
        let no_gc = NoGcScope::new(&root);
        let lib_load = LibraryLoading::new(0, 0, num, num, &no_gc);
        no_gc.abort_if_oom("setting up builtins");
        lib_load
    };

    let cap = GcTracer::with_extra(&root, &lib_load);
    for (id, builtin) in BUILTINS.iter().enumerate() {
        let measure = |code: *mut u8| {
            let offset = write_instr(
                code,
                0,
                Opcode::CallBuiltin,
                None,
                None,
                Immediate::U32(id as u32),
            );
            write_instr(code, offset, Opcode::Ret, None, None, Immediate::None)
        };
        let code_size = measure(std::ptr::null_mut());
        let added = lib_load.add_proc(&cap, builtin.name.to_string(), code_size, vec![0]);
        debug_assert!(added);

        let code = lib_load
            .proc_code(id as u32)
            .expect("builtin proc just added");
        measure(code);

        let closure = lib_load
            .closure(id as u32)
            .expect("builtin closures are preallocated");
        // SAFETY: a pre-allocated closure cell; builtins have no
        // environment.
        unsafe { init_closure(closure, code, std::ptr::null_mut()) };
        lib_load.add_symbol(format!("builtin.{}", builtin.name), closure);
    }

    let library = Rc::new(Library::from_loading(vec!["builtin".to_string()], lib_load));
    machine.add_module("builtin", Rc::clone(&library));
    library
}
