//! Bytecode listing for diagnostics and the CLI's `--print-bytecode`.

use crate::function::Function;
use crate::opcode::Op;
use core_types::{Atom, AtomTable};
use std::fmt::Write;

/// Renders a function's code one instruction per line.
pub fn disassemble(func: &Function, atoms: &AtomTable) -> String {
    let mut out = String::new();
    let name = atoms.resolve(func.name);
    let name = if name.is_empty() { "<anonymous>" } else { name };
    let _ = writeln!(
        out,
        "function {} ({} params, {} locals, {} constants, {} bytes)",
        name,
        func.param_end,
        func.locals.len(),
        func.constants.len(),
        func.code.len()
    );

    let mut pc = 0usize;
    while pc < func.code.len() {
        let byte = func.code[pc];
        let op = match Op::from_byte(byte) {
            Some(op) => op,
            None => {
                let _ = writeln!(out, "  {:04}  ??? 0x{:02x}", pc, byte);
                pc += 1;
                continue;
            }
        };
        let _ = write!(out, "  {:04}  {:<12}", pc, format!("{:?}", op));
        let operand_at = pc + 1;
        pc = operand_at + op.operand_width();
        match op.operand_width() {
            1 => {
                let v = func.code.get(operand_at).copied().unwrap_or(0);
                if op == Op::PushK {
                    match func.constants.get(v as usize) {
                        Some(k) => {
                            let _ = write!(out, " k{} ({})", v, k);
                        }
                        None => {
                            let _ = write!(out, " k{}", v);
                        }
                    }
                } else {
                    let _ = write!(out, " {}", v);
                }
            }
            2 => {
                let lo = func.code.get(operand_at).copied().unwrap_or(0);
                let hi = func.code.get(operand_at + 1).copied().unwrap_or(0);
                let raw = u16::from_le_bytes([lo, hi]);
                if op.is_jump() {
                    let target = pc as i64 + (raw as i16) as i64;
                    let _ = write!(out, " -> {}", target);
                } else {
                    let _ = write!(out, " {} ({})", raw, atoms.resolve(Atom(raw)));
                }
            }
            _ => {}
        }
        let _ = writeln!(out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Value;

    #[test]
    fn test_listing_shape() {
        let mut atoms = AtomTable::new();
        let name = atoms.intern("f");
        let counter = atoms.intern("counter");
        let mut f = Function::new(name);
        let k = f.add_constant(Value::Integer(5));
        f.emit_op(Op::PushId);
        f.emit_u16(counter.raw());
        f.emit_op(Op::PushK);
        f.emit_u8(k as u8);
        f.emit_op(Op::Move);
        f.emit_op(Op::Pop);
        f.emit_op(Op::Ret);
        f.emit_u8(0);

        let listing = disassemble(&f, &atoms);
        assert!(listing.contains("function f"));
        assert!(listing.contains("PushId"));
        assert!(listing.contains("counter"));
        assert!(listing.contains("k0 (5)"));
        assert!(listing.contains("Ret"));
    }
}
