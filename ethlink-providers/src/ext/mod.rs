//! Extensions layered on top of the [`Provider`](crate::Provider): the
//! multicall batcher and the dev-node control surface.

pub mod dev_node;

pub mod multicall;
