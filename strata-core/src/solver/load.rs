//! Build definition loader.
//!
//! Turns an ordered list of serialized op blobs into a deduplicated DAG.
//! Each blob is addressed by the digest of its exact bytes; all blobs but
//! the last form the pool of reachable ops, and the last is the terminal.
//! Materialized vertices are cached by digest so diamond dependencies
//! share one instance. Input indices are not validated here; they are
//! checked lazily when a vertex resolves its mounts.

use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::solver::Vertex;
use prost::Message;
use std::collections::HashMap;
use std::sync::Arc;
use strata_api::strata::v1 as pb;

/// Load a definition and return the effective root vertex.
///
/// A terminal op with no body and exactly one input is a return marker:
/// it is unwrapped and the named input becomes the root.
pub fn load(def: &[Vec<u8>]) -> Result<Arc<Vertex>> {
    if def.is_empty() {
        return Err(StrataError::InvalidOp { reason: "empty definition".to_string() });
    }

    let mut pool: HashMap<Digest, pb::Op> = HashMap::new();
    let mut terminal = None;
    for (i, blob) in def.iter().enumerate() {
        let op = pb::Op::decode(blob.as_slice())?;
        let digest = Digest::from_bytes(blob);
        if i != def.len() - 1 {
            pool.insert(digest.clone(), op.clone());
        }
        terminal = Some((digest, op));
    }
    let (digest, op) = terminal.expect("definition checked non-empty");

    let mut cache = HashMap::new();
    let vertex = load_recursive(digest, &op, &pool, &mut cache)?;

    if vertex.op().op.is_none() && vertex.inputs().len() == 1 {
        return Ok(vertex.inputs()[0].clone());
    }
    Ok(vertex)
}

fn load_recursive(
    digest: Digest,
    op: &pb::Op,
    pool: &HashMap<Digest, pb::Op>,
    cache: &mut HashMap<Digest, Arc<Vertex>>,
) -> Result<Arc<Vertex>> {
    if let Some(v) = cache.get(&digest) {
        return Ok(v.clone());
    }
    let mut inputs = Vec::with_capacity(op.inputs.len());
    for input in &op.inputs {
        let input_digest = Digest::parse(&input.digest)?;
        let input_op = pool
            .get(&input_digest)
            .ok_or_else(|| StrataError::MissingInput { digest: input.digest.clone() })?;
        inputs.push(load_recursive(input_digest, input_op, pool, cache)?);
    }
    let vertex = Arc::new(Vertex::new(digest.clone(), op.clone(), inputs));
    cache.insert(digest, vertex.clone());
    Ok(vertex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llb;

    #[test]
    fn test_load_unwraps_return_op() {
        let def = llb::image("alpine:3.19").marshal().unwrap();
        let root = load(&def.def).unwrap();
        // The return marker is elided; the root is the source vertex.
        assert!(matches!(root.op().op, Some(pb::op::Op::Source(_))));
        assert!(root.inputs().is_empty());
    }

    #[test]
    fn test_load_dedups_diamond() {
        let base = llb::image("alpine:3.19");
        let b = base.run(["b"]).build().root();
        let c = base.run(["c"]).build().root();
        let d = b.run(["d"]).mount_readonly("/c", &c).build().root();

        let def = d.marshal().unwrap();
        let root = load(&def.def).unwrap();
        assert_eq!(root.inputs().len(), 2);

        // Both paths reach the same vertex instance for the shared base.
        let base_via_b = root.inputs()[0].inputs()[0].clone();
        let base_via_c = root.inputs()[1].inputs()[0].clone();
        assert!(Arc::ptr_eq(&base_via_b, &base_via_c));
    }

    #[test]
    fn test_load_missing_input() {
        let def = llb::image("alpine:3.19").run(["x"]).build().root().marshal().unwrap();
        // Drop the source blob: the exec's input digest now dangles.
        let broken: Vec<Vec<u8>> = def.def[1..].to_vec();
        let err = load(&broken).unwrap_err();
        assert!(matches!(err, StrataError::MissingInput { .. }));
    }

    #[test]
    fn test_load_malformed_blob() {
        let err = load(&[vec![0xff, 0xff, 0xff, 0xff]]).unwrap_err();
        assert!(matches!(err, StrataError::MalformedOp(_)));
    }

    #[test]
    fn test_load_empty_definition() {
        assert!(load(&[]).is_err());
    }
}
