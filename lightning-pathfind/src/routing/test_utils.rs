// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Graph construction helpers shared by the routing tests.

use crate::routing::gossip::{ChannelInfo, ChannelUpdateInfo, LocalChannel, NetworkGraph, NodeId, RoutingFees};
use crate::routing::router::PathFinder;
use crate::util::scid_utils::ShortChannelId;
use crate::util::test_utils::TestLogger;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use std::sync::Arc;

pub(crate) fn get_node_ids(count: usize) -> Vec<NodeId> {
	let secp_ctx = Secp256k1::new();
	(1..=count as u8).map(|i| {
		let secret = SecretKey::from_slice(&hex::decode(format!("{:02x}", i).repeat(32)).unwrap()[..]).unwrap();
		NodeId::from_pubkey(&PublicKey::from_secret_key(&secp_ctx, &secret))
	}).collect()
}

pub(crate) fn scid(id: u64) -> ShortChannelId {
	ShortChannelId::from_u64(id)
}

pub(crate) fn build_graph() -> (Arc<NetworkGraph<Arc<TestLogger>>>, Arc<TestLogger>) {
	let logger = Arc::new(TestLogger::new());
	let network_graph = Arc::new(NetworkGraph::new(Arc::clone(&logger)));
	(network_graph, logger)
}

pub(crate) fn build_graph_and_finder() -> (Arc<NetworkGraph<Arc<TestLogger>>>,
	PathFinder<Arc<NetworkGraph<Arc<TestLogger>>>, Arc<TestLogger>>, Arc<TestLogger>)
{
	let (network_graph, logger) = build_graph();
	let path_finder = PathFinder::new(Arc::clone(&network_graph), Arc::clone(&logger));
	(network_graph, path_finder, logger)
}

/// Adds a channel, putting the endpoints into canonical order for the caller.
pub(crate) fn add_channel(network_graph: &NetworkGraph<Arc<TestLogger>>, short_channel_id: ShortChannelId,
	node_a: NodeId, node_b: NodeId, capacity_sats: Option<u64>)
{
	let (node_one, node_two) = if node_a < node_b { (node_a, node_b) } else { (node_b, node_a) };
	network_graph.add_channel(short_channel_id, node_one, node_two, capacity_sats).unwrap();
}

pub(crate) fn update_channel(network_graph: &NetworkGraph<Arc<TestLogger>>, short_channel_id: ShortChannelId,
	source: &NodeId, enabled: bool, cltv_expiry_delta: u16, htlc_minimum_msat: u64,
	htlc_maximum_msat: Option<u64>, fee_base_msat: u32, fee_proportional_millionths: u32, timestamp: u32)
{
	network_graph.update_channel_policy(&short_channel_id, source, ChannelUpdateInfo {
		last_update: timestamp,
		enabled,
		cltv_expiry_delta,
		htlc_minimum_msat,
		htlc_maximum_msat,
		fees: RoutingFees {
			base_msat: fee_base_msat,
			proportional_millionths: fee_proportional_millionths,
		},
	}).unwrap();
}

pub(crate) fn update_channel_with_limits(network_graph: &NetworkGraph<Arc<TestLogger>>,
	short_channel_id: ShortChannelId, source: &NodeId, htlc_minimum_msat: u64,
	htlc_maximum_msat: Option<u64>, timestamp: u32)
{
	update_channel(network_graph, short_channel_id, source, true, 40, htlc_minimum_msat,
		htlc_maximum_msat, 0, 0, timestamp);
}

/// A stand-in for one of our own channels: zero-fee policies in both directions and
/// configurable liquidity predicates.
pub(crate) struct TestLocalChannel {
	channel_info: ChannelInfo,
	can_pay: bool,
	can_receive: bool,
}

impl TestLocalChannel {
	pub(crate) fn new(node_a: NodeId, node_b: NodeId) -> Self {
		let (node_one, node_two) = if node_a < node_b { (node_a, node_b) } else { (node_b, node_a) };
		let policy = ChannelUpdateInfo {
			last_update: 0,
			enabled: true,
			cltv_expiry_delta: 40,
			htlc_minimum_msat: 0,
			htlc_maximum_msat: None,
			fees: RoutingFees { base_msat: 0, proportional_millionths: 0 },
		};
		TestLocalChannel {
			channel_info: ChannelInfo {
				node_one,
				one_to_two: Some(policy.clone()),
				node_two,
				two_to_one: Some(policy),
				capacity_sats: None,
			},
			can_pay: true,
			can_receive: true,
		}
	}

	pub(crate) fn with_can_pay(mut self, can_pay: bool) -> Self {
		self.can_pay = can_pay;
		self
	}
}

impl LocalChannel for TestLocalChannel {
	fn channel_info(&self) -> ChannelInfo {
		self.channel_info.clone()
	}
	fn policy_published_by(&self, source: &NodeId) -> Option<ChannelUpdateInfo> {
		self.channel_info.policy_published_by(source).cloned()
	}
	fn can_pay(&self, _amount_msat: u64, _check_frozen: bool) -> bool {
		self.can_pay
	}
	fn can_receive(&self, _amount_msat: u64, _check_frozen: bool) -> bool {
		self.can_receive
	}
}
