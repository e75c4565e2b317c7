//! End-to-end rewrite passes: assemble, transform, encode, evaluate.

use std::sync::Arc;

use anyhow::Result;
use codeweave_core::{Const, Encoding, RawCode};
use codeweave_ir::{assemble, decode, eval, Code, EncodeError, EvalOptions, InstrId, Operand};
use codeweave_ops::Opcode;
use codeweave_rewrite::{
    op, seq, Mode, Rewrite, RewriteError, Rule, RuleSet, TransformOptions, Transformer,
};
use pretty_assertions::assert_eq;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
}

const ADD: &str = "
    .name add
    .args a, b
    .line 1
        LOAD_FAST  a
        LOAD_FAST  b
        BINARY_ADD
        RETURN_VALUE
";

fn run(raw: &RawCode, args: &[Const]) -> Const { eval(raw, args, &EvalOptions::default()).unwrap().value }

fn add2mul<S>() -> Rule<S> {
    Rule::new("add2mul", op(Opcode::BINARY_ADD), |rw: &mut Rewrite<'_, S>, _: &[InstrId]| {
        Ok(vec![rw.emit(Opcode::BINARY_MULTIPLY, Operand::None)?])
    })
    .unwrap()
}

fn args(a: i64, b: i64) -> [Const; 2] { [Const::Int(a), Const::Int(b)] }

#[test]
fn add_becomes_multiply() -> Result<()> {
    init_tracing();
    let code = assemble(ADD)?;
    assert_eq!(run(&code.to_raw()?, &args(3, 4)), Const::Int(7));

    let mut rules = RuleSet::new();
    rules.add(add2mul());
    let out = Transformer::new(rules, ()).transform(&code)?;
    assert_eq!(out.opcodes(), vec![
        Opcode::LOAD_FAST,
        Opcode::LOAD_FAST,
        Opcode::BINARY_MULTIPLY,
        Opcode::RETURN_VALUE
    ]);
    assert_eq!(run(&out.to_raw()?, &args(3, 4)), Const::Int(12));
    Ok(())
}

#[test]
fn raw_units_round_trip_through_the_transformer() -> Result<()> {
    init_tracing();
    let mut legacy = assemble(&format!(".encoding legacy\n{ADD}"))?.to_raw()?;
    legacy.name = "legacy_add".into();

    let mut rules = RuleSet::new();
    rules.add(add2mul());
    let mut t = Transformer::new(rules, ());
    let out = t.transform_raw(&legacy, Encoding::Legacy)?;
    let options = EvalOptions { encoding: Encoding::Legacy, ..EvalOptions::default() };
    assert_eq!(eval(&out, &args(5, 6), &options)?.value, Const::Int(30));

    let untouched = Transformer::new(RuleSet::<()>::new(), ()).transform_raw(&legacy, Encoding::Legacy)?;
    assert_eq!(untouched, legacy);
    Ok(())
}

#[test]
fn nested_units_are_rewritten_first() -> Result<()> {
    init_tracing();
    let inner = assemble(ADD)?.to_raw()?;
    let mut outer = codeweave_ir::CodeBuilder::new();
    outer.name("outer");
    outer.push(Opcode::LOAD_CONST, Const::Code(Box::new(inner)))?;
    outer.push_bare(Opcode::RETURN_VALUE)?;
    let outer = outer.build()?;

    let mut rules: RuleSet<Vec<String>> = RuleSet::new();
    rules.add(add2mul());
    rules.rule("mark", op(Opcode::RETURN_VALUE), |rw: &mut Rewrite<'_, Vec<String>>, m: &[InstrId]| {
        let name = rw.code().name.clone();
        rw.state_mut().push(name);
        Ok(m.to_vec())
    })?;

    let mut t = Transformer::new(rules, Vec::new());
    let out = t.transform(&outer)?;
    assert_eq!(t.state(), &vec!["add".to_owned(), "outer".to_owned()]);

    let Some(Const::Code(rewritten)) = out.consts().into_iter().next() else { panic!("no nested unit") };
    assert_eq!(run(&rewritten, &args(3, 4)), Const::Int(12));
    Ok(())
}

#[test]
fn shared_nested_units_are_rewritten_once() -> Result<()> {
    let inner = Const::Code(Box::new(assemble(ADD)?.to_raw()?));
    let mut outer = codeweave_ir::CodeBuilder::new();
    outer.name("outer");
    outer.push(Opcode::LOAD_CONST, inner.clone())?;
    outer.push_bare(Opcode::POP_TOP)?;
    outer.push(Opcode::LOAD_CONST, inner)?;
    outer.push_bare(Opcode::RETURN_VALUE)?;
    let outer = outer.build()?;
    assert_eq!(outer.consts().len(), 1);

    let mut rules: RuleSet<Vec<String>> = RuleSet::new();
    rules.add(add2mul());
    rules.rule("mark", op(Opcode::RETURN_VALUE), |rw: &mut Rewrite<'_, Vec<String>>, m: &[InstrId]| {
        let name = rw.code().name.clone();
        rw.state_mut().push(name);
        Ok(m.to_vec())
    })?;

    let mut t = Transformer::new(rules, Vec::new());
    let out = t.transform(&outer)?;
    assert_eq!(t.state(), &vec!["add".to_owned(), "outer".to_owned()]);
    assert_eq!(out.consts().len(), 1);
    assert_eq!(out.instr(out.instrs()[0]).map(|i| i.operand()), out.instr(out.instrs()[2]).map(|i| i.operand()));
    Ok(())
}

#[test]
fn nested_units_follow_the_output_encoding() -> Result<()> {
    let inner = assemble(ADD)?.to_raw()?;
    let mut outer = codeweave_ir::CodeBuilder::new();
    outer.name("outer");
    outer.push(Opcode::LOAD_CONST, Const::Code(Box::new(inner)))?;
    outer.push_bare(Opcode::RETURN_VALUE)?;
    let outer = outer.build()?;
    assert_eq!(outer.encoding(), Encoding::Wordcode);

    let legacy = TransformOptions { encoding: Some(Encoding::Legacy), ..TransformOptions::default() };
    let mut rules = RuleSet::new();
    rules.add(add2mul::<()>());
    let mut t = Transformer::new(rules, ()).with_options(legacy);

    let out = t.transform(&outer)?;
    assert_eq!(out.encoding(), Encoding::Legacy);
    let Some(Const::Code(nested)) = out.consts().into_iter().next() else { panic!("no nested unit") };
    assert_eq!(decode(&nested, Encoding::Legacy)?.opcodes()[2], Opcode::BINARY_MULTIPLY);
    let options = EvalOptions { encoding: Encoding::Legacy, ..EvalOptions::default() };
    assert_eq!(eval(&nested, &args(3, 4), &options)?.value, Const::Int(12));

    // the result is a consistent unit: it decodes and transforms again
    let raw = t.transform_raw(&outer.to_raw()?, Encoding::Wordcode)?;
    let again = t.transform_raw(&raw, Encoding::Legacy)?;
    assert_eq!(decode(&again, Encoding::Legacy)?.opcodes(), vec![Opcode::LOAD_CONST, Opcode::RETURN_VALUE]);
    assert_eq!(again, raw);
    Ok(())
}

#[test]
fn derived_rules_override_inherited_ones() -> Result<()> {
    let mut base = RuleSet::new();
    base.rule("add2mul", op(Opcode::BINARY_ADD), |rw: &mut Rewrite<'_, ()>, _: &[InstrId]| {
        Ok(vec![rw.emit(Opcode::BINARY_SUBTRACT, Operand::None)?])
    })?;
    base.rule("swap", seq([op(Opcode::LOAD_FAST), op(Opcode::LOAD_FAST)]), |_: &mut Rewrite<'_, ()>, m: &[InstrId]| {
        Ok(vec![m[1], m[0]])
    })?;

    let mut derived = RuleSet::new();
    derived.add(add2mul());
    derived.extend(&base);
    assert_eq!(derived.names(), vec!["add2mul", "swap"]);

    let code = assemble(ADD)?;
    let with_base = Transformer::new(base, ()).transform(&code)?;
    assert_eq!(run(&with_base.to_raw()?, &args(3, 10)), Const::Int(7));

    let with_derived = Transformer::new(derived, ()).transform(&code)?;
    assert_eq!(with_derived.opcodes()[2], Opcode::BINARY_MULTIPLY);
    assert_eq!(run(&with_derived.to_raw()?, &args(3, 10)), Const::Int(30));
    Ok(())
}

const MODES: &str = "
        LOAD_CONST 1
        POP_TOP
        NOP
        LOAD_CONST 2
        POP_TOP
        LOAD_CONST 5
        RETURN_VALUE
";

fn mode_rules() -> RuleSet<()> {
    let mut rules = RuleSet::new();
    rules
        .rule("enter", op(Opcode::NOP), |rw: &mut Rewrite<'_, ()>, m: &[InstrId]| {
            rw.begin(Mode(1));
            Ok(m.to_vec())
        })
        .unwrap();
    rules.add(
        Rule::new("double", op(Opcode::LOAD_CONST), |rw: &mut Rewrite<'_, ()>, m: &[InstrId]| {
            assert_eq!(rw.mode(), Mode(1));
            match rw.operand(m[0])? {
                Operand::Const(Const::Int(v)) => {
                    let doubled = Const::Int(v * 2);
                    Ok(vec![rw.load_const(doubled)?])
                }
                _ => Err(anyhow::anyhow!("not an integer").into()),
            }
        })
        .unwrap()
        .in_modes([Mode(1)]),
    );
    rules
}

#[test]
fn modes_gate_rules_for_the_rest_of_the_pass() -> Result<()> {
    let code = assemble(MODES)?;
    let mut t = Transformer::new(mode_rules(), ());
    let out = t.transform(&code)?;

    let values: Vec<_> = out
        .iter()
        .filter_map(|(_, i)| match i.operand() {
            Operand::Const(c) => Some(c.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![Const::Int(1), Const::Int(4), Const::Int(10)]);
    assert_eq!(run(&out.to_raw()?, &[]), Const::Int(10));

    // each pass starts over in the default mode
    let again = t.transform(&code)?;
    assert_eq!(again.to_raw()?, out.to_raw()?);
    assert_eq!(t.depth(), 0);
    Ok(())
}

#[test]
fn mode_stack_unwinds_on_error() -> Result<()> {
    let code = assemble(&MODES.replace("LOAD_CONST 5", "LOAD_CONST 'five'"))?;
    let mut t = Transformer::new(mode_rules(), ());
    let err = t.transform(&code).unwrap_err();
    assert_eq!(err.to_string(), "not an integer");
    assert_eq!(t.depth(), 0);

    let ok = t.transform(&assemble(MODES)?)?;
    assert_eq!(run(&ok.to_raw()?, &[]), Const::Int(10));
    Ok(())
}

#[test]
fn handlers_can_rewrite_nested_units_on_demand() -> Result<()> {
    let inner = assemble(ADD)?.to_raw()?;
    let mut outer = codeweave_ir::CodeBuilder::new();
    outer.push_bare(Opcode::NOP)?;
    outer.push(Opcode::LOAD_CONST, Const::Code(Box::new(inner)))?;
    outer.push_bare(Opcode::RETURN_VALUE)?;
    let outer = outer.build()?;

    let mut rules = RuleSet::new();
    rules.rule("enter", op(Opcode::NOP), |rw: &mut Rewrite<'_, usize>, _: &[InstrId]| {
        rw.begin(Mode(7));
        Ok(Vec::new())
    })?;
    rules.add(add2mul());
    rules.add(
        Rule::new("again", op(Opcode::LOAD_CONST), |rw: &mut Rewrite<'_, usize>, m: &[InstrId]| {
            let Operand::Const(Const::Code(raw)) = rw.operand(m[0])?.clone() else { return Ok(m.to_vec()) };
            let twice = rw.transform_nested(&raw)?;
            assert_eq!(rw.mode(), Mode(7));
            *rw.state_mut() += 1;
            Ok(vec![rw.load_const(Const::Code(Box::new(twice)))?])
        })?
        .in_modes([Mode(7)]),
    );

    let mut t = Transformer::new(rules, 0usize);
    let out = t.transform(&outer)?;
    assert_eq!(*t.state(), 1);
    let Some(Const::Code(raw)) = out.consts().into_iter().next() else { panic!("no nested unit") };
    // add2mul already ran before the scan; the second pass finds nothing left to change
    assert_eq!(decode(&raw, Encoding::Wordcode)?.opcodes()[2], Opcode::BINARY_MULTIPLY);
    assert_eq!(run(&raw, &args(2, 5)), Const::Int(10));
    Ok(())
}

const BRANCH: &str = "
    .args a
        LOAD_FAST a
        POP_JUMP_IF_FALSE skip
        LOAD_CONST 1
        RETURN_VALUE
    skip:
        NOP
        LOAD_CONST 3
        RETURN_VALUE
";

fn replace_nop(steal: bool) -> RuleSet<Vec<InstrId>> {
    let mut rules = RuleSet::new();
    rules
        .rule("nop", op(Opcode::NOP), move |rw: &mut Rewrite<'_, Vec<InstrId>>, m: &[InstrId]| {
            let head = rw.load_const(Const::Int(2))?;
            let pop = rw.emit(Opcode::POP_TOP, Operand::None)?;
            if steal {
                rw.steal(head, m[0])?;
            }
            rw.state_mut().extend([m[0], head]);
            Ok(vec![head, pop])
        })
        .unwrap();
    rules
}

#[test]
fn steal_retargets_jumps() -> Result<()> {
    let code = assemble(BRANCH)?;
    let mut t = Transformer::new(replace_nop(true), Vec::new());
    let out: Code = t.transform(&code)?;
    let (old, head) = (t.state()[0], t.state()[1]);

    let jump = out.instrs()[1];
    assert_eq!(out.instr(jump).and_then(|i| i.jump_target()), Some(head));
    assert!(out.pool().target_of(old).is_empty());
    assert_eq!(out.pool().target_of(head), &[jump]);

    let raw = out.to_raw()?;
    assert_eq!(run(&raw, &[Const::Int(0)]), Const::Int(3));
    assert_eq!(run(&raw, &[Const::Int(1)]), Const::Int(1));
    Ok(())
}

#[test]
fn dropping_a_jump_target_without_steal_fails_to_encode() -> Result<()> {
    let code = assemble(BRANCH)?;
    let out = Transformer::new(replace_nop(false), Vec::new()).transform(&code)?;
    assert!(matches!(out.to_raw(), Err(EncodeError::UnresolvedJump { .. })));
    Ok(())
}

#[test]
fn stacksize_follows_the_final_sequence() -> Result<()> {
    let mut rules = RuleSet::new();
    rules.rule("widen", op(Opcode::LOAD_CONST), |rw: &mut Rewrite<'_, ()>, m: &[InstrId]| {
        let extra = rw.load_const(Const::None)?;
        let more = rw.load_const(Const::Ellipsis)?;
        let pop = rw.emit(Opcode::POP_TOP, Operand::None)?;
        let pop2 = rw.emit(Opcode::POP_TOP, Operand::None)?;
        Ok(vec![extra, more, pop, pop2, m[0]])
    })?;
    let code = assemble("LOAD_CONST 1\nLOAD_CONST 2\nBINARY_ADD\nRETURN_VALUE\n")?;
    assert_eq!(code.to_raw()?.stacksize, 2);

    let out = Transformer::new(rules, ()).transform(&code)?;
    let prefix_max = out
        .iter()
        .scan(0i32, |depth, (_, i)| {
            *depth += i.stack_effect();
            Some(*depth)
        })
        .max()
        .unwrap_or(0);
    let raw = out.to_raw()?;
    assert_eq!(raw.stacksize, u32::try_from(prefix_max)?);
    assert_eq!(raw.stacksize, 3);
    assert_eq!(run(&raw, &[]), Const::Int(3));
    Ok(())
}

#[test]
fn optimizer_runs_on_every_encoded_unit() -> Result<()> {
    let failing = TransformOptions {
        optimizer: Some(Arc::new(|_: &[u8], _: &[Const], _: &[String], _: &[u8]| -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("optimizer refused")
        })),
        ..TransformOptions::default()
    };
    let raw = assemble(ADD)?.to_raw()?;
    let err = Transformer::new(RuleSet::<()>::new(), ()).with_options(failing).transform_raw(&raw, Encoding::Wordcode);
    assert!(matches!(err, Err(RewriteError::Encode(EncodeError::Optimizer(_)))));

    let identity = TransformOptions {
        optimizer: Some(Arc::new(|code: &[u8], _: &[Const], _: &[String], _: &[u8]| -> anyhow::Result<Vec<u8>> {
            Ok(code.to_vec())
        })),
        ..TransformOptions::default()
    };
    let out = Transformer::new(RuleSet::<()>::new(), ()).with_options(identity).transform_raw(&raw, Encoding::Wordcode)?;
    assert_eq!(out, raw);
    Ok(())
}

#[test]
fn rule_sets_are_shared_across_threads() -> Result<()> {
    let mut rules = RuleSet::new();
    rules.add(add2mul::<()>());
    let code = assemble(ADD)?;
    let raw = code.to_raw()?;

    let results: Vec<RawCode> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rules = rules.clone();
                let raw = &raw;
                scope.spawn(move || Transformer::new(rules, ()).transform_raw(raw, Encoding::Wordcode).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(run(&results[0], &args(4, 4)), Const::Int(16));
    Ok(())
}
