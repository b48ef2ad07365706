//! Bytecode disassembler, used by `talon --dump-bytecode` and by tests that
//! want to assert on compiled shape without a full VM run.

use super::{Chunk, Opcode};
use std::fmt::Write;

pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    writeln!(out, "== {name} ==").unwrap();
    if !chunk.constants.is_empty() {
        writeln!(out, "-- constants --").unwrap();
        for (i, c) in chunk.constants.iter().enumerate() {
            writeln!(out, "{i:>4} = {c}").unwrap();
        }
    }
    writeln!(out, "-- code --").unwrap();
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        writeln!(out, "{line}").unwrap();
        offset = next;
    }
    out
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let byte = chunk.code[offset];
    let op = match Opcode::try_from(byte) {
        Ok(op) => op,
        Err(b) => return (format!("{offset:04}  <unknown opcode {b}>"), offset + 1),
    };

    match op {
        Opcode::Constant | Opcode::GetGlobal | Opcode::SetGlobal | Opcode::DefineGlobal => {
            u16_operand_instr(chunk, offset, op, true)
        }
        Opcode::Struct => {
            let hi = chunk.code[offset + 1] as u16;
            let lo = chunk.code[offset + 2] as u16;
            let count = (hi << 8) | lo;
            // Trailed by one name-constant index per field, consumed by the
            // VM after the value count operand.
            (
                format!("{offset:04}  {op:?} {count} fields"),
                offset + 3 + count as usize * 2,
            )
        }
        Opcode::Array | Opcode::Class | Opcode::Method | Opcode::GetProperty | Opcode::SetProperty
        | Opcode::GetSuper => {
            u16_operand_instr(chunk, offset, op, false)
        }
        Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue | Opcode::Loop => {
            let hi = chunk.code[offset + 1] as u16;
            let lo = chunk.code[offset + 2] as u16;
            let jump = (hi << 8) | lo;
            let target = if op == Opcode::Loop {
                offset + 3 - jump as usize
            } else {
                offset + 3 + jump as usize
            };
            (format!("{offset:04}  {op:?} -> {target:04}"), offset + 3)
        }
        Opcode::GetLocal | Opcode::SetLocal | Opcode::GetUpvalue | Opcode::SetUpvalue => {
            let slot = chunk.code[offset + 1];
            (format!("{offset:04}  {op:?} {slot}"), offset + 2)
        }
        Opcode::Call => {
            let argc = chunk.code[offset + 1];
            (format!("{offset:04}  {op:?} ({argc} args)"), offset + 2)
        }
        Opcode::Invoke | Opcode::SuperInvoke => {
            let argc = chunk.code[offset + 1];
            let hi = chunk.code[offset + 2] as u16;
            let lo = chunk.code[offset + 3] as u16;
            let idx = (hi << 8) | lo;
            let name = chunk
                .constants
                .get(idx as usize)
                .map(|v| v.to_string())
                .unwrap_or_default();
            (
                format!("{offset:04}  {op:?} {name} ({argc} args)"),
                offset + 4,
            )
        }
        Opcode::Closure => {
            let hi = chunk.code[offset + 1] as u16;
            let lo = chunk.code[offset + 2] as u16;
            let idx = (hi << 8) | lo;
            let upvalue_count = chunk.code[offset + 3] as usize;
            let consumed = 4 + upvalue_count * 2;
            (
                format!("{offset:04}  {op:?} const={idx} upvalues={upvalue_count}"),
                offset + consumed,
            )
        }
        _ => (format!("{offset:04}  {op:?}"), offset + 1),
    }
}

fn u16_operand_instr(chunk: &Chunk, offset: usize, op: Opcode, show_constant: bool) -> (String, usize) {
    let hi = chunk.code[offset + 1] as u16;
    let lo = chunk.code[offset + 2] as u16;
    let idx = (hi << 8) | lo;
    if show_constant {
        let value = chunk
            .constants
            .get(idx as usize)
            .map(|v| v.to_string())
            .unwrap_or_default();
        (format!("{offset:04}  {op:?} {idx} ({value})"), offset + 3)
    } else {
        (format!("{offset:04}  {op:?} {idx}"), offset + 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;
    use crate::value::Value;

    #[test]
    fn test_disassemble_constant() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0)).unwrap();
        chunk.emit(Opcode::Constant, Span::dummy());
        chunk.emit_u16(idx);
        let out = disassemble(&chunk, "test");
        assert!(out.contains("Constant"));
    }
}
