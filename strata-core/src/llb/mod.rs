//! Client-side build definition builder.
//!
//! States describe filesystem contents; `run` layers an exec on top.
//! `marshal` serializes the reachable graph into an ordered blob list with
//! digest-keyed deduplication, terminated by an input-only "return" op
//! naming the requested output. Mounts are sorted by destination before
//! marshalling so equal graphs produce equal bytes.

use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::source::{ATTR_KEEP_GIT_DIR, ATTR_LOCAL_SESSION_ID};
use prost::Message;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use strata_api::strata::v1 as pb;

/// Sentinel output index: this mount produces no output.
pub const SKIP_OUTPUT: i64 = -1;
/// Sentinel input index: the mount starts from an empty filesystem.
pub const EMPTY_INPUT: i64 = -1;

/// A marshalled build definition: ordered op blobs, root last.
#[derive(Debug, Clone, Default)]
pub struct Definition {
    pub def: Vec<Vec<u8>>,
}

#[derive(Clone)]
enum Node {
    Scratch,
    Source { identifier: String, attrs: BTreeMap<String, String> },
    ExecOutput { exec: Arc<ExecDef>, index: i64 },
}

/// A filesystem state in the build graph.
#[derive(Clone)]
pub struct State {
    node: Node,
}

/// Raw source state from a scheme-qualified identifier.
pub fn source(identifier: &str) -> State {
    State {
        node: Node::Source { identifier: identifier.to_string(), attrs: BTreeMap::new() },
    }
}

pub fn image(reference: &str) -> State {
    source(&format!("docker-image://{}", reference))
}

pub fn git(remote: &str, git_ref: &str) -> State {
    if git_ref.is_empty() {
        source(&format!("git://{}", remote))
    } else {
        source(&format!("git://{}#{}", remote, git_ref))
    }
}

pub fn local(name: &str) -> State {
    source(&format!("local://{}", name))
}

/// The empty filesystem. Marshals to no op at all; mounts on it carry the
/// empty-input sentinel.
pub fn scratch() -> State {
    State { node: Node::Scratch }
}

impl State {
    /// Set a source attribute. No-op on non-source states.
    pub fn attr(mut self, key: &str, value: &str) -> State {
        if let Node::Source { attrs, .. } = &mut self.node {
            attrs.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn keep_git_dir(self) -> State {
        self.attr(ATTR_KEEP_GIT_DIR, "true")
    }

    pub fn session_id(self, id: &str) -> State {
        self.attr(ATTR_LOCAL_SESSION_ID, id)
    }

    /// Start an exec layered on this state: it becomes the root mount,
    /// writable, with an output.
    pub fn run<I, S>(&self, args: I) -> Exec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Exec {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            cwd: "/".to_string(),
            mounts: vec![MountSpec {
                dest: "/".to_string(),
                readonly: false,
                has_output: true,
                source: self.clone(),
            }],
        }
    }

    /// Serialize the graph reachable from this state.
    pub fn marshal(&self) -> Result<Definition> {
        let mut list = Vec::new();
        let mut cache = HashSet::new();
        let Some((digest, index)) = marshal_node(&self.node, &mut list, &mut cache) else {
            return Err(StrataError::InvalidOp { reason: "cannot marshal scratch".to_string() });
        };
        let ret = pb::Op {
            op: None,
            inputs: vec![pb::Input { digest: digest.to_string(), index }],
        };
        append(&ret, &mut list, &mut cache);
        Ok(Definition { def: list })
    }
}

struct MountSpec {
    dest: String,
    readonly: bool,
    has_output: bool,
    source: State,
}

/// Builder for an exec operation.
pub struct Exec {
    args: Vec<String>,
    env: Vec<String>,
    cwd: String,
    mounts: Vec<MountSpec>,
}

impl Exec {
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    pub fn cwd(mut self, dir: &str) -> Self {
        self.cwd = dir.to_string();
        self
    }

    /// Writable mount producing an output.
    pub fn mount(mut self, dest: &str, source: &State) -> Self {
        self.mounts.push(MountSpec {
            dest: dest.to_string(),
            readonly: false,
            has_output: true,
            source: source.clone(),
        });
        self
    }

    /// Read-only mount, no output.
    pub fn mount_readonly(mut self, dest: &str, source: &State) -> Self {
        self.mounts.push(MountSpec {
            dest: dest.to_string(),
            readonly: true,
            has_output: false,
            source: source.clone(),
        });
        self
    }

    /// Freeze into an exec state. Mounts are sorted by destination and
    /// output indices assigned in that order.
    pub fn build(mut self) -> ExecState {
        self.mounts.sort_by(|a, b| a.dest.cmp(&b.dest));
        let mut next_output = 0i64;
        let mounts = self
            .mounts
            .into_iter()
            .map(|m| {
                let output_index = if m.has_output {
                    let idx = next_output;
                    next_output += 1;
                    idx
                } else {
                    SKIP_OUTPUT
                };
                MountDef { dest: m.dest, readonly: m.readonly, output_index, source: m.source }
            })
            .collect();
        ExecState {
            exec: Arc::new(ExecDef { args: self.args, env: self.env, cwd: self.cwd, mounts }),
        }
    }
}

struct MountDef {
    dest: String,
    readonly: bool,
    output_index: i64,
    source: State,
}

struct ExecDef {
    args: Vec<String>,
    env: Vec<String>,
    cwd: String,
    mounts: Vec<MountDef>,
}

/// A built exec; its outputs are addressable states.
#[derive(Clone)]
pub struct ExecState {
    exec: Arc<ExecDef>,
}

impl ExecState {
    /// The root mount's output.
    pub fn root(&self) -> State {
        self.output("/").expect("exec has no root mount output")
    }

    /// The output produced at `dest`, if that mount declares one.
    pub fn output(&self, dest: &str) -> Option<State> {
        self.exec.mounts.iter().find(|m| m.dest == dest && m.output_index != SKIP_OUTPUT).map(
            |m| State {
                node: Node::ExecOutput { exec: self.exec.clone(), index: m.output_index },
            },
        )
    }
}

fn marshal_node(
    node: &Node,
    list: &mut Vec<Vec<u8>>,
    cache: &mut HashSet<Digest>,
) -> Option<(Digest, i64)> {
    match node {
        Node::Scratch => None,
        Node::Source { identifier, attrs } => {
            let op = pb::Op {
                op: Some(pb::op::Op::Source(pb::SourceOp {
                    identifier: identifier.clone(),
                    attrs: attrs
                        .iter()
                        .map(|(k, v)| pb::Attr { key: k.clone(), value: v.clone() })
                        .collect(),
                })),
                inputs: Vec::new(),
            };
            Some((append(&op, list, cache), 0))
        }
        Node::ExecOutput { exec, index } => {
            Some((marshal_exec(exec, list, cache), *index))
        }
    }
}

fn marshal_exec(exec: &Arc<ExecDef>, list: &mut Vec<Vec<u8>>, cache: &mut HashSet<Digest>) -> Digest {
    let mut inputs: Vec<pb::Input> = Vec::new();
    let mut mounts = Vec::with_capacity(exec.mounts.len());
    for m in &exec.mounts {
        let input = match marshal_node(&m.source.node, list, cache) {
            None => EMPTY_INPUT,
            Some((digest, index)) => {
                let digest = digest.to_string();
                match inputs.iter().position(|i| i.digest == digest && i.index == index) {
                    Some(existing) => existing as i64,
                    None => {
                        inputs.push(pb::Input { digest, index });
                        (inputs.len() - 1) as i64
                    }
                }
            }
        };
        mounts.push(pb::Mount {
            input,
            dest: m.dest.clone(),
            readonly: m.readonly,
            output: m.output_index,
        });
    }
    let op = pb::Op {
        op: Some(pb::op::Op::Exec(pb::ExecOp {
            meta: Some(pb::Meta {
                args: exec.args.clone(),
                env: exec.env.clone(),
                cwd: exec.cwd.clone(),
            }),
            mounts,
        })),
        inputs,
    };
    append(&op, list, cache)
}

fn append(op: &pb::Op, list: &mut Vec<Vec<u8>>, cache: &mut HashSet<Digest>) -> Digest {
    let bytes = op.encode_to_vec();
    let digest = Digest::from_bytes(&bytes);
    if cache.insert(digest.clone()) {
        list.push(bytes);
    }
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_single_source() {
        let def = image("alpine:3.19").marshal().unwrap();
        // Source op + return op.
        assert_eq!(def.def.len(), 2);

        let last = pb::Op::decode(def.def.last().unwrap().as_slice()).unwrap();
        assert!(last.op.is_none());
        assert_eq!(last.inputs.len(), 1);
        assert_eq!(last.inputs[0].index, 0);
        assert_eq!(last.inputs[0].digest, Digest::from_bytes(&def.def[0]).to_string());
    }

    #[test]
    fn test_marshal_is_deterministic() {
        let state = image("alpine:3.19").run(["sh", "-c", "true"]).env("A", "1").build().root();
        assert_eq!(state.marshal().unwrap().def, state.marshal().unwrap().def);
    }

    #[test]
    fn test_diamond_dedups_shared_base() {
        let base = image("alpine:3.19");
        let b = base.run(["b"]).build().root();
        let c = base.run(["c"]).build().root();
        let d = b.run(["d"]).mount_readonly("/c", &c).build().root();

        let def = d.marshal().unwrap();
        // base + b + c + d + return: the shared base appears once.
        assert_eq!(def.def.len(), 5);

        // The terminal exec references two distinct inputs.
        let d_op = pb::Op::decode(def.def[def.def.len() - 2].as_slice()).unwrap();
        assert_eq!(d_op.inputs.len(), 2);
    }

    #[test]
    fn test_scratch_mount_uses_empty_input() {
        let s = scratch().run(["touch", "/out"]).build().root();
        let def = s.marshal().unwrap();
        // Exec op + return op; scratch itself marshals nothing.
        assert_eq!(def.def.len(), 2);
        let op = pb::Op::decode(def.def[0].as_slice()).unwrap();
        let Some(pb::op::Op::Exec(exec)) = op.op else { panic!("expected exec op") };
        assert_eq!(exec.mounts[0].input, EMPTY_INPUT);
        assert!(op.inputs.is_empty());
    }

    #[test]
    fn test_scratch_alone_cannot_marshal() {
        assert!(scratch().marshal().is_err());
    }

    #[test]
    fn test_output_indices_follow_sorted_dests() {
        let base = image("alpine:3.19");
        let extra = image("busybox");
        // "/work" sorts after "/", so the root keeps output 0.
        let exec = base.run(["make"]).mount("/work", &extra).build();
        let root_def = exec.root().marshal().unwrap();
        let op = pb::Op::decode(root_def.def[root_def.def.len() - 2].as_slice()).unwrap();
        let Some(pb::op::Op::Exec(e)) = op.op else { panic!("expected exec op") };
        assert_eq!(e.mounts[0].dest, "/");
        assert_eq!(e.mounts[0].output, 0);
        assert_eq!(e.mounts[1].dest, "/work");
        assert_eq!(e.mounts[1].output, 1);
        assert!(exec.output("/work").is_some());
        assert!(exec.output("/missing").is_none());
    }

    #[test]
    fn test_source_attrs_are_sorted_and_stable() {
        let a = source("git://example.com/repo").attr("b", "2").attr("a", "1");
        let b = source("git://example.com/repo").attr("a", "1").attr("b", "2");
        assert_eq!(a.marshal().unwrap().def, b.marshal().unwrap().def);
    }
}
