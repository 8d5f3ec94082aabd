use std::collections::HashSet;
use std::rc::Rc;

use crate::ast::{resolve, Comb, FixTarget, Node, NodeRef};
use crate::codegen::CompileError;

// ── Preprocess pass ──────────────────────────────────────────────────
//
// Bottom-up slot-filling walk over the combinator graph. It forces lazy
// and hole nodes, substitutes a `Fixpoint` for every back-edge (keyed on
// physical node identity), and absorbs `label` wrappers into the
// `expected` slot of the leaves below them. The walk keeps an explicit
// frame stack, so native stack use does not grow with parser depth.
//
// The pass is idempotent: a node whose slots are already filled returns
// immediately when no ambient label is in flight, which preserves sharing
// across multiple references to the same subtree. Under an ambient label
// the walked spine is cloned instead, so shared nodes are never mutated
// on behalf of one of their consumers.

struct Frame {
    node: NodeRef,
    ambient: Option<Rc<str>>,
    child_ambient: Option<Rc<str>>,
    comb: Comb,
    children: Vec<NodeRef>,
    results: Vec<NodeRef>,
}

enum Entered {
    /// The node resolved to a finished reference without needing a frame.
    Done(NodeRef),
    /// A frame was pushed; descend into its children.
    Descend,
}

pub(crate) fn preprocess(root: &NodeRef) -> Result<NodeRef, CompileError> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut path: HashSet<*const Node> = HashSet::new();

    let mut pending = match enter(root, None, &mut path, &mut frames)? {
        Entered::Done(n) => Some(n),
        Entered::Descend => None,
    };

    loop {
        if let Some(res) = pending.take() {
            match frames.last_mut() {
                None => return Ok(res),
                Some(f) => f.results.push(res),
            }
        }
        let next_child = {
            let top = frames.last().expect("preprocess frame stack empty");
            if top.results.len() < top.children.len() {
                Some((top.children[top.results.len()].clone(), top.child_ambient.clone()))
            } else {
                None
            }
        };
        if let Some((child, amb)) = next_child {
            match enter(&child, amb.as_ref(), &mut path, &mut frames)? {
                Entered::Done(n) => pending = Some(n),
                Entered::Descend => {}
            }
        } else {
            let f = frames.pop().expect("preprocess frame stack empty");
            path.remove(&Rc::as_ptr(&f.node));
            let rebuilt = finish(&f);
            let out = if f.ambient.is_some() {
                let fresh = Node::new(rebuilt);
                fresh.set_safe(f.node.is_safe());
                fresh.mark_done();
                fresh
            } else {
                f.node.set_comb(rebuilt);
                f.node.mark_done();
                f.node.clone()
            };
            pending = Some(out);
        }
    }
}

fn enter(
    n: &NodeRef,
    ambient: Option<&Rc<str>>,
    path: &mut HashSet<*const Node>,
    frames: &mut Vec<Frame>,
) -> Result<Entered, CompileError> {
    let mut cur = resolve(n)?;
    let mut amb: Option<Rc<str>> = ambient.cloned();

    // Strip relabel wrappers; the outermost label wins.
    loop {
        let comb = cur.comb_clone();
        if let Comb::ErrorRelabel { p, label } = comb {
            if amb.is_none() {
                amb = Some(Rc::from(label.as_str()));
            }
            cur = resolve(&p)?;
            continue;
        }
        break;
    }

    if path.contains(&Rc::as_ptr(&cur)) {
        // Back-edge: the recursion becomes a call to the original node.
        let fix = Node::new(Comb::Fixpoint {
            target: FixTarget::Back(Rc::downgrade(&cur)),
            expected: amb.map(|l| l.to_string()),
        });
        fix.mark_done();
        return Ok(Entered::Done(fix));
    }

    if cur.is_done() && amb.is_none() {
        return Ok(Entered::Done(cur));
    }

    let comb = cur.comb_clone();
    let children = comb.children();
    if children.is_empty() {
        let out = match &amb {
            Some(label) => match relabel_leaf(&comb, label) {
                Some(relabelled) => {
                    let fresh = Node::new(relabelled);
                    fresh.set_safe(cur.is_safe());
                    fresh.mark_done();
                    fresh
                }
                None => {
                    cur.mark_done();
                    cur
                }
            },
            None => {
                cur.mark_done();
                cur
            }
        };
        return Ok(Entered::Done(out));
    }

    // Call-like nodes keep their body shared and carry the label at the
    // call site instead of pushing it into the (shared) body.
    let child_ambient = match &comb {
        Comb::NotFollowedBy { .. } | Comb::Subroutine { .. } => None,
        _ => amb.clone(),
    };

    path.insert(Rc::as_ptr(&cur));
    frames.push(Frame {
        node: cur,
        ambient: amb,
        child_ambient,
        comb,
        children,
        results: Vec::new(),
    });
    Ok(Entered::Descend)
}

fn finish(f: &Frame) -> Comb {
    let rebuilt = f.comb.with_children(f.results.clone());
    match (&f.ambient, rebuilt) {
        (Some(label), Comb::NotFollowedBy { p, .. }) => Comb::NotFollowedBy {
            p,
            expected: Some(label.to_string()),
        },
        (Some(label), Comb::Subroutine { p, .. }) => Comb::Subroutine {
            p,
            expected: Some(label.to_string()),
        },
        (_, other) => other,
    }
}

/// Leaves with an `expected` slot absorb the ambient label; anything else
/// passes through untouched.
fn relabel_leaf(comb: &Comb, label: &Rc<str>) -> Option<Comb> {
    let l = Some(label.to_string());
    match comb {
        Comb::CharTok { c, .. } => Some(Comb::CharTok { c: *c, expected: l }),
        Comb::StringTok { s, .. } => Some(Comb::StringTok { s: s.clone(), expected: l }),
        Comb::Satisfy { pred, .. } => Some(Comb::Satisfy { pred: pred.clone(), expected: l }),
        Comb::Eof { .. } => Some(Comb::Eof { expected: l }),
        Comb::Keyword { kw, .. } => Some(Comb::Keyword { kw: kw.clone(), expected: l }),
        Comb::Operator { op, .. } => Some(Comb::Operator { op: op.clone(), expected: l }),
        Comb::StringLiteral { raw, .. } => Some(Comb::StringLiteral { raw: *raw, expected: l }),
        Comb::Empty { .. } => Some(Comb::Empty { expected: l }),
        Comb::Fixpoint { target, .. } => Some(Comb::Fixpoint { target: target.clone(), expected: l }),
        _ => None,
    }
}
