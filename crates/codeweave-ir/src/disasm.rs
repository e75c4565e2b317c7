//! Human readable listings.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use codeweave_core::Const;

use crate::{code::Code, decode::decode, instr::Operand};

/// Multi-line listing of `code` and, after it, of every nested unit.
///
/// Columns: source line (at line starts only), `>>` on jump targets, byte
/// offset under the unit's encoding, mnemonic and resolved operand.
pub fn disassemble(code: &Code) -> String {
    let mut out = String::new();
    listing(&mut out, code);
    out
}

fn listing(out: &mut String, code: &Code) {
    let encoding = code.encoding();
    let _ = writeln!(
        out,
        "== {} == ({}:{}, {encoding}, args=[{}], stacksize={})",
        code.name(),
        code.filename(),
        code.firstlineno(),
        code.argnames().join(", "),
        code.stacksize()
    );

    let mut offsets = HashMap::with_capacity(code.len());
    let mut at = 0usize;
    for (id, instr) in code.iter() {
        offsets.insert(id, at);
        at += encoding.instr_width(instr.opcode().has_arg());
    }
    let targets: HashSet<_> = code.iter().filter_map(|(_, i)| i.jump_target()).collect();

    for (id, instr) in code.iter() {
        let line = code.lines().get(&id).map(|l| format!("{l:>4}")).unwrap_or_else(|| "    ".to_owned());
        let marker = if targets.contains(&id) { ">>" } else { "  " };
        let operand = match instr.operand() {
            Operand::Jump(target) => match offsets.get(target) {
                Some(to) => format!("to {to}"),
                None => format!("to {target} (unresolved)"),
            },
            other => other.to_string(),
        };
        let row = format!("{line} {marker} {:>5} {:<20} {operand}", offsets[&id], instr.opcode().name());
        let _ = writeln!(out, "{}", row.trim_end());
    }

    for value in code.consts() {
        if let Const::Code(raw) = value {
            let _ = writeln!(out);
            match decode(&raw, encoding) {
                Ok(nested) => listing(out, &nested),
                Err(err) => {
                    let _ = writeln!(out, ";; {}: {err}", raw.name);
                }
            }
        }
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use pretty_assertions::assert_eq;

    #[test]
    fn listing_marks_lines_and_targets() {
        let code = assemble(
            ".name t\n.args x\n.line 1\nLOAD_FAST x\nPOP_JUMP_IF_FALSE done\nLOAD_CONST 1\nRETURN_VALUE\ndone:\n.line 2\nLOAD_CONST None\nRETURN_VALUE\n",
        )
        .unwrap();
        let text = disassemble(&code);
        let rows: Vec<_> = text.lines().collect();

        assert_eq!(rows[0], "== t == (<codeweave>:1, wordcode, args=[x], stacksize=1)");
        assert_eq!(rows.len(), 7);
        assert!(rows[1].starts_with("   1"));
        assert!(rows[2].contains("POP_JUMP_IF_FALSE") && rows[2].ends_with("to 8"));
        assert!(rows[3].starts_with("    "));
        assert!(rows[5].starts_with("   2 >>") && rows[5].ends_with("None"));
    }

    #[test]
    fn nested_units_follow() {
        let inner = assemble(".name inner\nLOAD_CONST 3\nRETURN_VALUE\n").unwrap().to_raw().unwrap();
        let mut b = crate::CodeBuilder::new();
        b.name("outer");
        b.push(codeweave_ops::Opcode::LOAD_CONST, Const::Code(Box::new(inner))).unwrap();
        b.push_bare(codeweave_ops::Opcode::RETURN_VALUE).unwrap();
        let text = disassemble(&b.build().unwrap());

        assert!(text.starts_with("== outer =="));
        assert!(text.contains("<code inner>"));
        assert!(text.contains("\n\n== inner =="));
    }
}
