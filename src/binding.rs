//! Operator table: the names under which the host framework finds the entry
//! points, and a uniform calling convention over them.

use crate::error::{Error, Result};
use crate::ops::fmha::{BackwardOptions, BackwardOutput, ForwardOptions, ForwardOutput};
use crate::ops::traits::MemoryEfficientAttentionOps;
use crate::runtime::FmhaClient;
use crate::tensor::Tensor;
use std::collections::BTreeMap;

pub const OP_FORWARD: &str = "fmha::efficient_attention_forward_ck";
pub const OP_BACKWARD: &str = "fmha::efficient_attention_backward_ck";
pub const OP_FORWARD_DECODER: &str = "fmha::efficient_attention_forward_decoder_ck";
/// Availability check; echoes its argument so a harness can confirm the
/// extension loaded.
pub const OP_IS_AVAILABLE: &str = "fmha::is_ck_fmha_available";

/// Arguments of one operator call.
#[derive(Debug, Clone)]
pub enum OpArgs<'a> {
    Forward {
        query: &'a Tensor,
        key: &'a Tensor,
        value: &'a Tensor,
        opts: ForwardOptions<'a>,
    },
    Backward {
        grad_out: &'a Tensor,
        query: &'a Tensor,
        key: &'a Tensor,
        value: &'a Tensor,
        logsumexp: &'a Tensor,
        out: &'a Tensor,
        opts: BackwardOptions<'a>,
    },
    Decoder {
        query: &'a Tensor,
        key: &'a Tensor,
        value: &'a Tensor,
        seq_positions: &'a Tensor,
        scale: Option<f64>,
    },
    Available(f64),
}

impl OpArgs<'_> {
    fn kind(&self) -> &'static str {
        match self {
            OpArgs::Forward { .. } => "forward",
            OpArgs::Backward { .. } => "backward",
            OpArgs::Decoder { .. } => "decoder",
            OpArgs::Available(_) => "available",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OpOutput {
    Forward(ForwardOutput),
    Backward(BackwardOutput),
    Decoder(Tensor),
    Available(f64),
}

type Handler = for<'a> fn(&FmhaClient, OpArgs<'a>) -> Result<OpOutput>;

fn mismatch(name: &str, args: &OpArgs<'_>) -> Error {
    Error::invalid_argument("args", format!("{name} does not take {} arguments", args.kind()))
}

fn forward(client: &FmhaClient, args: OpArgs<'_>) -> Result<OpOutput> {
    match args {
        OpArgs::Forward {
            query,
            key,
            value,
            opts,
        } => client
            .efficient_attention_forward(query, key, value, &opts)
            .map(OpOutput::Forward),
        other => Err(mismatch(OP_FORWARD, &other)),
    }
}

fn backward(client: &FmhaClient, args: OpArgs<'_>) -> Result<OpOutput> {
    match args {
        OpArgs::Backward {
            grad_out,
            query,
            key,
            value,
            logsumexp,
            out,
            opts,
        } => client
            .efficient_attention_backward(grad_out, query, key, value, logsumexp, out, &opts)
            .map(OpOutput::Backward),
        other => Err(mismatch(OP_BACKWARD, &other)),
    }
}

fn forward_decoder(client: &FmhaClient, args: OpArgs<'_>) -> Result<OpOutput> {
    match args {
        OpArgs::Decoder {
            query,
            key,
            value,
            seq_positions,
            scale,
        } => client
            .efficient_attention_forward_decoder(query, key, value, seq_positions, scale)
            .map(OpOutput::Decoder),
        other => Err(mismatch(OP_FORWARD_DECODER, &other)),
    }
}

fn is_available(_: &FmhaClient, args: OpArgs<'_>) -> Result<OpOutput> {
    match args {
        OpArgs::Available(value) => Ok(OpOutput::Available(value)),
        other => Err(mismatch(OP_IS_AVAILABLE, &other)),
    }
}

/// Name-to-handler map of every registered operator.
pub struct OperatorTable {
    ops: BTreeMap<&'static str, Handler>,
}

impl Default for OperatorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorTable {
    pub fn new() -> Self {
        let mut ops: BTreeMap<&'static str, Handler> = BTreeMap::new();
        ops.insert(OP_FORWARD, forward);
        ops.insert(OP_BACKWARD, backward);
        ops.insert(OP_FORWARD_DECODER, forward_decoder);
        ops.insert(OP_IS_AVAILABLE, is_available);
        Self { ops }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ops.keys().copied()
    }

    pub fn call(&self, name: &str, client: &FmhaClient, args: OpArgs<'_>) -> Result<OpOutput> {
        let handler = self.ops.get(name).ok_or_else(|| Error::UnknownOperator {
            name: name.to_string(),
        })?;
        tracing::trace!(op = name, args = args.kind(), "operator call");
        handler(client, args)
    }
}
