//! Dependency analysis and parallel dispatch of inline polyglot blocks.
//!
//! When a compound block contains consecutive statements whose right-hand
//! sides are inline blocks, independent blocks are grouped and dispatched
//! onto worker threads, each observing a snapshot of its bindings. Results
//! are written back to the shared environment in source order on the
//! evaluator thread, so observable host state is indistinguishable from
//! sequential evaluation.

use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ahash::AHashSet;
use tracing::debug;

use crate::exception::{ExcKind, RunResult, SimpleError};
use crate::expressions::{CodeRange, Expr, Node, PolyglotBlock};
use crate::interp::Interpreter;
use crate::polyglot::callback::CallbackHost;
use crate::polyglot::payload::{self, Payload};
use crate::polyglot::{execute_prepared, BlockOutcome, LangId};
use crate::types::Type;

/// One extracted polyglot statement.
struct Item {
    block: Rc<PolyglotBlock>,
    /// The declared variable for `let x = <<…>>`, with its annotation.
    assign: Option<(String, Option<Type>)>,
    range: CodeRange,
}

impl Item {
    fn reads(&self) -> AHashSet<&str> {
        self.block.bindings.iter().map(String::as_str).collect()
    }

    fn writes(&self) -> AHashSet<&str> {
        self.assign
            .iter()
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

fn as_polyglot(node: &Node) -> Option<Item> {
    match node {
        Node::Expr(expr) => match &expr.expr {
            Expr::Polyglot(block) => Some(Item {
                block: Rc::clone(block),
                assign: None,
                range: expr.range,
            }),
            _ => None,
        },
        Node::Let {
            name,
            ty,
            value,
            range,
        } => match &value.expr {
            Expr::Polyglot(block) => Some(Item {
                block: Rc::clone(block),
                assign: Some((name.clone(), ty.clone())),
                range: *range,
            }),
            _ => None,
        },
        _ => None,
    }
}

/// Length of the leading run of polyglot statements. Non-polyglot
/// statements are barriers: no group may cross them.
pub(crate) fn polyglot_run_len(nodes: &[Node]) -> usize {
    nodes.iter().take_while(|n| as_polyglot(n).is_some()).count()
}

/// `earlier → later` dependency: RAW, WAW, or WAR over the binding lists
/// and assigned variables.
fn depends(earlier: &Item, later: &Item) -> bool {
    let (er, ew) = (earlier.reads(), earlier.writes());
    let (lr, lw) = (later.reads(), later.writes());
    // RAW
    lr.intersection(&ew).next().is_some()
        // WAW
        || ew.intersection(&lw).next().is_some()
        // WAR
        || er.intersection(&lw).next().is_some()
}

/// Greedy grouping in source order: a block joins the current group only
/// if it depends on none of the group's members.
fn group(items: &[Item]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        if current.iter().any(|&j| depends(&items[j], item)) {
            groups.push(std::mem::take(&mut current));
        }
        current.push(i);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Executes a run of consecutive polyglot statements, grouping
/// independent blocks and dispatching each group in parallel.
pub(crate) fn execute_run(interp: &mut Interpreter, nodes: &[Node]) -> RunResult<()> {
    let items: Vec<Item> = nodes.iter().filter_map(as_polyglot).collect();
    let groups = group(&items);
    debug!(
        blocks = items.len(),
        groups = groups.len(),
        "scheduling polyglot run"
    );
    for group in groups {
        execute_group(interp, &items, &group)?;
    }
    Ok(())
}

struct Prepared {
    lang: LangId,
    code: String,
    bindings: Vec<(String, Payload)>,
    callback_ids: Vec<u32>,
}

enum WorkerMsg {
    Call {
        id: u32,
        args: Vec<Payload>,
        reply: mpsc::Sender<Result<Payload, String>>,
    },
    Done {
        slot: usize,
        result: Result<BlockOutcome, SimpleError>,
    },
}

struct ChannelHost {
    tx: mpsc::Sender<WorkerMsg>,
}

impl CallbackHost for ChannelHost {
    fn invoke(&mut self, id: u32, args: Vec<Payload>) -> Result<Payload, String> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(WorkerMsg::Call {
                id,
                args,
                reply: reply_tx,
            })
            .map_err(|_| "evaluator stopped servicing callbacks".to_owned())?;
        reply_rx
            .recv()
            .map_err(|_| "evaluator dropped the callback reply".to_owned())?
    }
}

fn bind_result(
    interp: &mut Interpreter,
    item: &Item,
    outcome: &BlockOutcome,
    lang: LangId,
) -> RunResult<()> {
    if !outcome.passthrough.is_empty() {
        if let Err(err) = interp.writer.write(&outcome.passthrough) {
            return Err(interp.throw(ExcKind::IOError, err.to_string(), item.range));
        }
    }
    let value = payload::to_value(
        &outcome.value,
        &mut interp.heap,
        &mut interp.structs,
        lang.name(),
    );
    if let Some((name, ty)) = &item.assign {
        let value = interp.check_binding(value, ty.as_ref(), name, item.range)?;
        interp.env.define(name.clone(), value);
    }
    Ok(())
}

fn execute_group(interp: &mut Interpreter, items: &[Item], group: &[usize]) -> RunResult<()> {
    if group.len() == 1 {
        let item = &items[group[0]];
        let value = interp.eval_polyglot(&item.block)?;
        if let Some((name, ty)) = &item.assign {
            let mark = interp.temp_roots.len();
            interp.temp_roots.push(value);
            let result = interp.check_binding(value, ty.as_ref(), name, item.range);
            interp.temp_roots.truncate(mark);
            let value = result?;
            interp.env.define(name.clone(), value);
        }
        return Ok(());
    }

    // snapshot phase, in source order; a failure here behaves like the
    // failing statement: everything before it still runs and commits
    let mut prepared: Vec<Prepared> = Vec::new();
    let mut prepare_error: Option<(usize, SimpleError)> = None;
    for (slot, &idx) in group.iter().enumerate() {
        let item = &items[idx];
        let Some(lang) = LangId::from_tag(&item.block.lang) else {
            prepare_error = Some((
                slot,
                SimpleError::new(
                    ExcKind::PolyglotError,
                    format!("unknown inline language tag `{}`", item.block.lang),
                ),
            ));
            break;
        };
        match interp.snapshot_bindings(&item.block.bindings, lang) {
            Ok((bindings, callback_ids)) => prepared.push(Prepared {
                lang,
                code: item.block.code.clone(),
                bindings,
                callback_ids,
            }),
            Err(err) => {
                prepare_error = Some((slot, err));
                break;
            }
        }
    }

    let timeout = interp.config.timeout;
    let launch_count = prepared.len();
    let mut results: Vec<Option<Result<BlockOutcome, SimpleError>>> =
        (0..launch_count).map(|_| None).collect();

    if launch_count > 0 {
        // the cache handle moves out so worker threads can share it while
        // the evaluator keeps servicing callbacks
        let cache = interp.cache.take();
        let (tx, rx) = mpsc::channel::<WorkerMsg>();
        thread::scope(|scope| {
            for (slot, job) in prepared.iter().enumerate() {
                let tx = tx.clone();
                let cache_ref = cache.as_ref();
                let job_timeout: Duration = timeout;
                scope.spawn(move || {
                    let mut host = ChannelHost { tx: tx.clone() };
                    let result = execute_prepared(
                        job.lang,
                        &job.code,
                        &job.bindings,
                        job_timeout,
                        &mut host,
                        cache_ref,
                    );
                    let _ = tx.send(WorkerMsg::Done { slot, result });
                });
            }
            drop(tx);
            let mut remaining = launch_count;
            while remaining > 0 {
                match rx.recv() {
                    Ok(WorkerMsg::Call { id, args, reply }) => {
                        let _ = reply.send(interp.service_callback(id, args));
                    }
                    Ok(WorkerMsg::Done { slot, result }) => {
                        results[slot] = Some(result);
                        remaining -= 1;
                    }
                    Err(_) => break,
                }
            }
        });
        interp.cache = cache;
    }

    for job in &prepared {
        for &id in &job.callback_ids {
            interp.callbacks.release(id);
        }
    }

    // write-back in source order; the first error (in source order) is
    // re-raised after every member has settled, and later members do not
    // commit, matching sequential semantics
    for (slot, &idx) in group.iter().enumerate() {
        if let Some((error_slot, err)) = &prepare_error {
            if slot == *error_slot {
                let err = err.clone();
                return Err(interp.throw_simple(err, items[idx].range));
            }
        }
        let Some(result) = results.get_mut(slot).and_then(Option::take) else {
            break;
        };
        match result {
            Ok(outcome) => bind_result(interp, &items[idx], &outcome, prepared[slot].lang)?,
            Err(err) => return Err(interp.throw_simple(err, items[idx].range)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::CodeRange;

    fn item(reads: &[&str], writes: Option<&str>) -> Item {
        Item {
            block: Rc::new(PolyglotBlock {
                lang: "python".to_owned(),
                bindings: reads.iter().map(|s| (*s).to_owned()).collect(),
                code: String::new(),
                range: CodeRange::point(1, 1),
            }),
            assign: writes.map(|w| (w.to_owned(), None)),
            range: CodeRange::point(1, 1),
        }
    }

    fn shapes(items: &[Item]) -> Vec<Vec<usize>> {
        group(items)
    }

    #[test]
    fn independent_blocks_share_a_group() {
        let items = vec![item(&[], Some("a")), item(&[], Some("b"))];
        assert_eq!(shapes(&items), vec![vec![0, 1]]);
    }

    #[test]
    fn raw_dependency_splits_groups() {
        // the second block reads what the first writes
        let items = vec![item(&[], Some("a")), item(&["a"], Some("b"))];
        assert_eq!(shapes(&items), vec![vec![0], vec![1]]);
    }

    #[test]
    fn waw_dependency_splits_groups() {
        let items = vec![item(&[], Some("a")), item(&[], Some("a"))];
        assert_eq!(shapes(&items), vec![vec![0], vec![1]]);
    }

    #[test]
    fn war_dependency_splits_groups() {
        // the first reads `a`, the second overwrites it
        let items = vec![item(&["a"], None), item(&[], Some("a"))];
        assert_eq!(shapes(&items), vec![vec![0], vec![1]]);
    }

    #[test]
    fn later_group_restarts_after_split() {
        let items = vec![
            item(&[], Some("a")),
            item(&[], Some("b")),
            item(&["a"], Some("c")),
            item(&["b"], Some("d")),
        ];
        // c depends on the first group; d joins c's group (no mutual deps)
        assert_eq!(shapes(&items), vec![vec![0, 1], vec![2, 3]]);
    }
}
