// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Landmark-style route precomputation.
//!
//! Each block, a deterministic pseudo-random set of "beacon" nodes is derived from the block
//! hash, and single-destination predecessor trees toward them are computed lazily and shared
//! across queries moving similar amounts. The cache is advisory: it trades staleness for
//! amortization, and callers fall back to a direct search whenever it comes up empty.

use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::{sha256, Hash};

use crate::routing::gossip::{LocalChannels, NetworkGraph, NodeId};
use crate::routing::router::{PathFinder, PaymentDirection, PaymentPath, PaymentRoute,
	PredecessorMap, RouteEdge, RoutingError};
use crate::util::logger::Logger;
use crate::util::scid_utils::ShortChannelId;

use core::ops::Deref;
use std::collections::HashMap;

/// The number of beacon nodes selected per block.
pub const NUM_BEACONS: usize = 20;

/// Identifies one cached beacon route: which beacon it leads to (or from), and which of the
/// querying node's channels it passes through first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BeaconKey {
	/// The beacon the route leads to (or from).
	pub beacon_id: NodeId,
	/// The channel the route leaves (or enters) the querying node through.
	pub first_hop: ShortChannelId,
}

/// The interior state of a [`PathFinder`]'s beacon cache.
///
/// Every cached predecessor map is discarded whenever the beacon set rotates (a new block
/// hash) or the graph's version token moves: any change to the graph invalidates the cache.
#[derive(Default)]
pub(super) struct BeaconCache {
	block_hash: Option<BlockHash>,
	beacons: Vec<NodeId>,
	graph_version: u64,
	to_beacons: HashMap<u64, HashMap<NodeId, PredecessorMap>>,
	from_beacons: HashMap<u64, HashMap<NodeId, PredecessorMap>>,
}

impl BeaconCache {
	fn maps_for(&self, direction: PaymentDirection) -> &HashMap<u64, HashMap<NodeId, PredecessorMap>> {
		match direction {
			PaymentDirection::Outbound => &self.to_beacons,
			PaymentDirection::Inbound => &self.from_beacons,
		}
	}

	fn maps_for_mut(&mut self, direction: PaymentDirection) -> &mut HashMap<u64, HashMap<NodeId, PredecessorMap>> {
		match direction {
			PaymentDirection::Outbound => &mut self.to_beacons,
			PaymentDirection::Inbound => &mut self.from_beacons,
		}
	}
}

/// Quantizes an amount to the smallest power of ten containing it, so that nearby amounts
/// share cached search results. Exact powers of ten map to themselves.
pub fn quantize_amount(amount_sat: u64) -> u64 {
	let mut bucket = 1u64;
	while bucket < amount_sat {
		bucket = bucket.saturating_mul(10);
	}
	bucket
}

/// The Hamming weight of `node_id XOR seed`, both interpreted as big-endian integers.
///
/// Node ids are 33 bytes against a 32-byte seed, so the leading parity byte is XORed against
/// nothing and contributes its own weight.
fn beacon_distance(seed: &[u8; 32], node_id: &NodeId) -> u32 {
	let node_id_bytes = node_id.as_slice();
	let mut weight = node_id_bytes[0].count_ones();
	for (node_id_byte, seed_byte) in node_id_bytes[1..].iter().zip(seed.iter()) {
		weight += (node_id_byte ^ seed_byte).count_ones();
	}
	weight
}

impl<G: Deref<Target = NetworkGraph<L>>, L: Deref> PathFinder<G, L> where L::Target: Logger {
	/// Rotates the beacon set for a new chain tip.
	///
	/// A no-op when `block_hash` is unchanged. Otherwise the [`NUM_BEACONS`] nodes whose ids
	/// are popcount-closest to `sha256(block_hash)` (ties broken by node id) become the new
	/// beacons, and every cached predecessor map is discarded.
	pub fn update_beacons(&self, block_hash: BlockHash) {
		let mut cache = self.beacon_cache.write().unwrap();
		if cache.block_hash == Some(block_hash) {
			return;
		}
		let seed = sha256::Hash::hash(&block_hash.to_byte_array()).to_byte_array();
		let mut candidates: Vec<(u32, NodeId)> = self.network_graph().list_nodes().into_iter()
			.map(|node_id| (beacon_distance(&seed, &node_id), node_id)).collect();
		if candidates.is_empty() {
			log_warn!(self.logger, "No nodes known yet; beacon set for block {} is empty", block_hash);
		}
		candidates.sort();
		candidates.truncate(NUM_BEACONS);

		cache.block_hash = Some(block_hash);
		cache.beacons = candidates.into_iter().map(|(_, node_id)| node_id).collect();
		cache.graph_version = self.network_graph().version();
		cache.to_beacons.clear();
		cache.from_beacons.clear();
		log_info!(self.logger, "Selected {} beacons for block {}", cache.beacons.len(), block_hash);
	}

	/// The current beacon set, in popcount-distance order.
	pub fn beacons(&self) -> Vec<NodeId> {
		self.beacon_cache.read().unwrap().beacons.clone()
	}

	/// Predecessor maps toward (`Outbound`) or from (`Inbound`) every beacon, searched at
	/// 1000 times the quantized amount and memoized per `(bucket, direction)`.
	pub fn predecessors_to_beacons(&self, amount_sat: u64, direction: PaymentDirection)
		-> HashMap<NodeId, PredecessorMap>
	{
		let bucket = quantize_amount(amount_sat);
		{
			let cache = self.beacon_cache.read().unwrap();
			if cache.graph_version == self.network_graph().version() {
				if let Some(maps) = cache.maps_for(direction).get(&bucket) {
					return maps.clone();
				}
			}
		}

		// Compute outside the lock: the searches can be slow, and concurrent lookups should
		// not queue behind them. Racing computations of the same bucket overwrite each other,
		// which is harmless.
		let beacons = self.beacons();
		let graph_version = self.network_graph().version();
		let local_channels = LocalChannels::new();
		let amount_msat = 1000u64.saturating_mul(bucket);
		let mut maps = HashMap::with_capacity(beacons.len());
		for beacon_id in beacons {
			if let Ok(prev_node) = self.get_distances(None, &beacon_id, amount_msat, direction,
				&local_channels, None)
			{
				maps.insert(beacon_id, prev_node);
			}
		}
		log_debug!(self.logger, "Computed predecessor maps for {} beacons at {} sat", maps.len(), bucket);

		let mut cache = self.beacon_cache.write().unwrap();
		if cache.graph_version != graph_version {
			// Whatever was cached predates the graph state we just searched; drop it.
			cache.to_beacons.clear();
			cache.from_beacons.clear();
			cache.graph_version = graph_version;
		}
		cache.maps_for_mut(direction).insert(bucket, maps.clone());
		maps
	}

	/// For every beacon and every channel incident to `source_id`, the path reaching that
	/// beacon through that channel, keyed by `(beacon, first hop)`.
	///
	/// This lets a caller probe all of its first-hop options without re-running any search.
	pub fn paths_to_beacons(&self, amount_sat: u64, source_id: &NodeId, direction: PaymentDirection)
		-> HashMap<BeaconKey, PaymentPath>
	{
		let prev_nodes = self.predecessors_to_beacons(amount_sat, direction);
		let local_channels = LocalChannels::new();
		let mut out = HashMap::new();
		for (beacon_id, prev_node) in prev_nodes.iter() {
			for short_channel_id in self.network_graph().channels_for_node(source_id, &local_channels) {
				let channel_info = match self.network_graph().channel(&short_channel_id, &local_channels) {
					Some(channel_info) => channel_info,
					None => continue,
				};
				let next_node = match channel_info.other_node(source_id) {
					Some(next_node) => *next_node,
					None => continue,
				};
				if let Some(mut path) = Self::get_path(&next_node, beacon_id, prev_node) {
					path.insert(0, (next_node, short_channel_id));
					out.insert(BeaconKey { beacon_id: *beacon_id, first_hop: short_channel_id }, path);
				}
			}
		}
		out
	}

	/// Fully resolved routes to (or from) every beacon, keyed by `(beacon, first hop)`.
	///
	/// Routes whose policies have vanished from the graph since the predecessor maps were
	/// computed are dropped whole; a partial route is worse than none.
	pub fn routes_to_beacons(&self, amount_sat: u64, node_id: &NodeId, direction: PaymentDirection)
		-> HashMap<BeaconKey, PaymentRoute>
	{
		let paths = self.paths_to_beacons(amount_sat, node_id, direction);
		let local_channels = LocalChannels::new();
		let mut out = HashMap::new();
		for (beacon_key, path) in paths {
			match self.route_for_beacon_path(&path, node_id, direction, &local_channels) {
				Ok(route) => {
					log_info!(self.logger, "Route {} beacon {} via {}: {} hops",
						if direction == PaymentDirection::Outbound { "to" } else { "from" },
						beacon_key.beacon_id, beacon_key.first_hop, route.len());
					out.insert(beacon_key, route);
				},
				Err(err) => {
					log_debug!(self.logger, "Dropping beacon route via {}: {}", beacon_key.first_hop, err);
				},
			}
		}
		out
	}

	fn route_for_beacon_path(&self, path: &PaymentPath, from_node_id: &NodeId,
		direction: PaymentDirection, local_channels: &LocalChannels)
		-> Result<PaymentRoute, RoutingError>
	{
		match direction {
			PaymentDirection::Outbound => self.create_route_from_path(path, from_node_id, local_channels),
			PaymentDirection::Inbound => {
				// Value flows from the beacon toward us, so each hop's policy is the one
				// published by the node the path steps onto.
				let mut route = Vec::with_capacity(path.len());
				for (node_id, short_channel_id) in path.iter() {
					let policy = match self.network_graph().policy(short_channel_id, node_id, local_channels) {
						Some(policy) => policy,
						None => return Err(RoutingError::NoChannelPolicy(*short_channel_id)),
					};
					route.push(RouteEdge::from_channel_policy(&policy, *short_channel_id, *node_id,
						self.network_graph().node_features(node_id)));
				}
				Ok(route)
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::routing::gossip::NodeFeatures;
	use crate::routing::test_utils::{add_channel, build_graph_and_finder, get_node_ids, scid, update_channel};

	fn block_hash(byte: u8) -> BlockHash {
		BlockHash::from_byte_array([byte; 32])
	}

	#[test]
	fn test_quantize_amount() {
		assert_eq!(quantize_amount(0), 1);
		assert_eq!(quantize_amount(1), 1);
		assert_eq!(quantize_amount(2), 10);
		assert_eq!(quantize_amount(9), 10);
		assert_eq!(quantize_amount(10), 10);
		assert_eq!(quantize_amount(11), 100);
		assert_eq!(quantize_amount(99_999), 100_000);
		assert_eq!(quantize_amount(100_000), 100_000);
		assert_eq!(quantize_amount(100_001), 1_000_000);
	}

	#[test]
	fn test_beacon_selection() {
		let (network_graph, path_finder, _logger) = build_graph_and_finder();
		for node_id in get_node_ids(25) {
			network_graph.add_or_update_node(node_id, NodeFeatures::empty());
		}

		path_finder.update_beacons(block_hash(1));
		let beacons = path_finder.beacons();
		assert_eq!(beacons.len(), NUM_BEACONS);
		let known = network_graph.list_nodes();
		assert!(beacons.iter().all(|beacon_id| known.contains(beacon_id)));

		// Same tip: nothing changes. New tip: a fresh (possibly identical) selection.
		path_finder.update_beacons(block_hash(1));
		assert_eq!(path_finder.beacons(), beacons);
		path_finder.update_beacons(block_hash(2));
		assert_eq!(path_finder.beacons().len(), NUM_BEACONS);
	}

	#[test]
	fn test_beacon_selection_is_deterministic() {
		let (network_graph, path_finder, _logger) = build_graph_and_finder();
		let (other_graph, other_finder, _other_logger) = build_graph_and_finder();
		for node_id in get_node_ids(25) {
			network_graph.add_or_update_node(node_id, NodeFeatures::empty());
			other_graph.add_or_update_node(node_id, NodeFeatures::empty());
		}
		path_finder.update_beacons(block_hash(7));
		other_finder.update_beacons(block_hash(7));
		assert_eq!(path_finder.beacons(), other_finder.beacons());
	}

	#[test]
	fn test_update_beacons_discards_cached_maps() {
		let (network_graph, path_finder, _logger) = build_graph_and_finder();
		let node_ids = get_node_ids(3);
		add_channel(&network_graph, scid(1), node_ids[0], node_ids[1], None);
		add_channel(&network_graph, scid(2), node_ids[1], node_ids[2], None);
		for (channel, source) in [
			(scid(1), &node_ids[0]), (scid(1), &node_ids[1]),
			(scid(2), &node_ids[1]), (scid(2), &node_ids[2]),
		] {
			update_channel(&network_graph, channel, source, true, 40, 0, None, 0, 0, 1);
		}

		path_finder.update_beacons(block_hash(1));
		path_finder.predecessors_to_beacons(100, PaymentDirection::Outbound);
		assert_eq!(path_finder.beacon_cache.read().unwrap().to_beacons.len(), 1);

		// Same tip: the cache survives. New tip: it does not.
		path_finder.update_beacons(block_hash(1));
		assert_eq!(path_finder.beacon_cache.read().unwrap().to_beacons.len(), 1);
		path_finder.update_beacons(block_hash(2));
		assert_eq!(path_finder.beacon_cache.read().unwrap().to_beacons.len(), 0);
	}

	#[test]
	fn test_graph_change_invalidates_cache() {
		let (network_graph, path_finder, _logger) = build_graph_and_finder();
		let node_ids = get_node_ids(4);
		add_channel(&network_graph, scid(1), node_ids[0], node_ids[1], None);
		update_channel(&network_graph, scid(1), &node_ids[0], true, 40, 0, None, 0, 0, 1);
		update_channel(&network_graph, scid(1), &node_ids[1], true, 40, 0, None, 0, 0, 1);

		path_finder.update_beacons(block_hash(1));
		let before = path_finder.predecessors_to_beacons(100, PaymentDirection::Outbound);
		assert!(before.values().any(|prev_node| prev_node.contains_key(&node_ids[0])
			|| prev_node.contains_key(&node_ids[1])));
		assert!(!before.values().any(|prev_node| prev_node.contains_key(&node_ids[2])));

		// Extending the graph moves its version, so the cached maps must not be served again.
		add_channel(&network_graph, scid(2), node_ids[1], node_ids[2], None);
		update_channel(&network_graph, scid(2), &node_ids[1], true, 40, 0, None, 0, 0, 1);
		update_channel(&network_graph, scid(2), &node_ids[2], true, 40, 0, None, 0, 0, 1);
		let after = path_finder.predecessors_to_beacons(100, PaymentDirection::Outbound);
		assert!(after.values().any(|prev_node| prev_node.contains_key(&node_ids[2])));
	}

	#[test]
	fn test_routes_to_beacons_prepend_first_hop() {
		let (network_graph, path_finder, _logger) = build_graph_and_finder();
		let node_ids = get_node_ids(3);
		let (node_a, node_b, node_c) = (node_ids[0], node_ids[1], node_ids[2]);
		add_channel(&network_graph, scid(1), node_a, node_b, None);
		add_channel(&network_graph, scid(2), node_b, node_c, None);
		for (channel, source) in [
			(scid(1), &node_a), (scid(1), &node_b),
			(scid(2), &node_b), (scid(2), &node_c),
		] {
			update_channel(&network_graph, channel, source, true, 40, 0, None, 0, 0, 1);
		}

		path_finder.update_beacons(block_hash(1));
		assert_eq!(path_finder.beacons().len(), 3);

		let routes = path_finder.routes_to_beacons(100, &node_a, PaymentDirection::Outbound);
		let to_c = routes.get(&BeaconKey { beacon_id: node_c, first_hop: scid(1) }).unwrap();
		assert_eq!(to_c.len(), 2);
		assert_eq!(to_c[0].node_id, node_b);
		assert_eq!(to_c[0].short_channel_id, scid(1));
		assert_eq!(to_c.last().unwrap().node_id, node_c);

		// A beacon which is a direct neighbor yields no entry: its tree never contains the
		// neighbor we would step through.
		assert!(!routes.keys().any(|beacon_key| beacon_key.beacon_id == node_b));
	}

	#[test]
	fn test_inbound_uses_far_end_policies() {
		let (network_graph, path_finder, _logger) = build_graph_and_finder();
		let node_ids = get_node_ids(2);
		let (node_a, node_b) = (node_ids[0], node_ids[1]);
		// Only a publishes a policy, so only flows originating at a are possible.
		add_channel(&network_graph, scid(1), node_a, node_b, None);
		update_channel(&network_graph, scid(1), &node_a, true, 40, 0, None, 0, 0, 1);

		path_finder.update_beacons(block_hash(1));
		let outbound = path_finder.predecessors_to_beacons(100, PaymentDirection::Outbound);
		assert!(outbound.get(&node_b).unwrap().contains_key(&node_a));

		// Paying out of b would use b's (missing) policy.
		let inbound = path_finder.predecessors_to_beacons(100, PaymentDirection::Inbound);
		assert!(!inbound.get(&node_b).unwrap().contains_key(&node_a));
	}
}
