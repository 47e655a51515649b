// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Finding payment paths over the channel graph lives here.
//!
//! A [`PathFinder`] wraps a [`NetworkGraph`] and answers path queries by running Dijkstra's
//! algorithm *from the destination back to the source*: fees compound toward the sender, so
//! only in that direction is the amount (and therefore the fee-dependent cost) crossing each
//! candidate channel known at the moment the channel is scored.

use crate::routing::beacons::BeaconCache;
use crate::routing::gossip::{ChannelUpdateInfo, LocalChannels, NetworkGraph, NodeFeatures, NodeId, RoutingFees};
use crate::util::logger::Logger;
use crate::util::scid_utils::ShortChannelId;

use core::cmp;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::RwLock;

/// The most edges a single payment path may contain; BOLT 4's onion packet cannot address
/// more hops than this.
pub const MAX_PATH_HOPS: usize = 20;

/// Scoring cost applied to every edge of a candidate path: one more edge is one more chance
/// for the payment to fail in flight.
pub(crate) const PATH_HOP_BASE_COST_MSAT: u64 = 500;

/// Edges demanding a time-lock delta of more than two weeks of blocks are never used.
pub const MAX_CLTV_EXPIRY_DELTA: u16 = 14 * 144;

/// Upper bound on the accumulated time-lock of a whole route, in blocks.
pub const MAX_TOTAL_CLTV_EXPIRY_DELTA: u32 = 28 * 144;

/// The CLTV expiry demanded of the final hop when validating a route against an invoice.
pub const MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE: u32 = 147;

/// Fees at or below this many msat are acceptable regardless of the payment amount.
const MAX_UNQUESTIONED_FEE_MSAT: u64 = 5_000;

/// Computes the fee charged for forwarding `forwarded_amount_msat`, per BOLT 7:
/// `fee_base_msat + forwarded_amount_msat * fee_proportional_millionths / 1_000_000`, with
/// truncating integer division.
///
/// Amounts on the network are bounded well below the point where this could wrap (BOLT 2
/// caps an HTLC at `2^32 - 1` msat); if a caller hands us garbage we saturate, and the
/// resulting fee fails [`is_fee_sane`] rather than corrupting the search.
pub fn fee_for_edge_msat(forwarded_amount_msat: u64, fee_base_msat: u32, fee_proportional_millionths: u32) -> u64 {
	let proportional = forwarded_amount_msat.checked_mul(fee_proportional_millionths as u64)
		.map(|part| part / 1_000_000).unwrap_or(u64::max_value());
	(fee_base_msat as u64).saturating_add(proportional)
}

/// Whether a fee is acceptable for a payment of the given amount: fees up to 5 sat are always
/// fine, and so are fees up to 1% of the payment.
pub fn is_fee_sane(fee_msat: u64, payment_amount_msat: u64) -> bool {
	if fee_msat <= MAX_UNQUESTIONED_FEE_MSAT {
		return true;
	}
	match fee_msat.checked_mul(100) {
		Some(scaled_fee) => scaled_fee <= payment_amount_msat,
		None => false,
	}
}

/// A hop in a payment route: if you travel through `short_channel_id`, you will reach
/// `node_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEdge {
	/// The node this edge arrives at.
	pub node_id: NodeId,
	/// The channel traversed to reach `node_id`.
	pub short_channel_id: ShortChannelId,
	/// The fees charged by the node forwarding into this edge.
	pub fees: RoutingFees,
	/// The CLTV delta this hop adds.
	pub cltv_expiry_delta: u16,
	/// The features announced by `node_id`.
	pub node_features: NodeFeatures,
}

impl RouteEdge {
	pub(crate) fn from_channel_policy(policy: &ChannelUpdateInfo, short_channel_id: ShortChannelId,
		end_node: NodeId, node_features: NodeFeatures) -> RouteEdge
	{
		RouteEdge {
			node_id: end_node,
			short_channel_id,
			fees: policy.fees,
			cltv_expiry_delta: policy.cltv_expiry_delta,
			node_features,
		}
	}

	/// The fee charged when `amount_msat` is forwarded through this edge.
	pub fn fee_for_edge(&self, amount_msat: u64) -> u64 {
		fee_for_edge_msat(amount_msat, self.fees.base_msat, self.fees.proportional_millionths)
	}

	/// Sanity heuristics for a single edge at the amount it would forward: the time-lock delta
	/// must be at most two weeks and the fee must pass [`is_fee_sane`].
	pub fn is_sane_to_use(&self, amount_msat: u64) -> bool {
		if self.cltv_expiry_delta > MAX_CLTV_EXPIRY_DELTA {
			return false;
		}
		is_fee_sane(self.fee_for_edge(amount_msat), amount_msat)
	}

	/// Whether the node this edge arrives at can process variable-length onion payloads.
	pub fn supports_variable_length_onion(&self) -> bool {
		self.node_features.supports_variable_length_onion()
	}
}

/// A path as returned by [`PathFinder::find_path_for_payment`]. An entry `(node_id, scid)`
/// reads as "to get to `node_id`, travel through `scid`"; the first entry leaves the sender,
/// the last arrives at the destination.
pub type PaymentPath = Vec<(NodeId, ShortChannelId)>;

/// A fully resolved route, sender side first; the last edge arrives at the payee.
pub type PaymentRoute = Vec<RouteEdge>;

/// The output of a search: maps each reached node to the neighbor it should forward to and
/// the channel to use. The search root has no entry.
pub type PredecessorMap = HashMap<NodeId, (NodeId, ShortChannelId)>;

/// Runs sanity checks on a whole route before it is used to send a payment.
///
/// Walks the route backward accumulating the amount each hop must forward and the total
/// time-lock. The first edge is skipped: the sender forwards over its own outgoing channel
/// without paying itself a fee.
pub fn is_route_sane_to_use(route: &PaymentRoute, invoice_amount_msat: u64, min_final_cltv_expiry: u32) -> bool {
	if route.len() > MAX_PATH_HOPS {
		return false;
	}
	let mut amt = invoice_amount_msat;
	let mut cltv = min_final_cltv_expiry;
	for route_edge in route.iter().skip(1).rev() {
		if !route_edge.is_sane_to_use(amt) {
			return false;
		}
		amt = amt.saturating_add(route_edge.fee_for_edge(amt));
		cltv += route_edge.cltv_expiry_delta as u32;
	}
	let total_fee = amt - invoice_amount_msat;
	if cltv > MAX_TOTAL_CLTV_EXPIRY_DELTA {
		return false;
	}
	is_fee_sane(total_fee, invoice_amount_msat)
}

/// An error from a route query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingError {
	/// No usable path exists between the endpoints at the requested amount. The caller may
	/// retry once gossip has caught up, or with other hints.
	NoPathFound,
	/// The policy for a channel on the selected path disappeared from the graph mid-query.
	/// Transient; a fresh search will route around the channel.
	NoChannelPolicy(ShortChannelId),
	/// A path references a channel which does not link its nodes. The graph is corrupt.
	InvariantViolation,
	/// The caller's [`SearchInterrupt`] fired.
	Interrupted,
}

impl fmt::Display for RoutingError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			RoutingError::NoPathFound => write!(f, "no route available"),
			RoutingError::NoChannelPolicy(short_channel_id) =>
				write!(f, "cannot find channel policy for short_channel_id: {}", short_channel_id),
			RoutingError::InvariantViolation => write!(f, "channel graph is inconsistent"),
			RoutingError::Interrupted => write!(f, "path search was interrupted"),
		}
	}
}

/// Cooperatively interrupts a running path search.
///
/// The search polls the flag between priority-queue pops, so interruption latency is one
/// relaxation round. The search itself has no deadline; callers wanting a timeout fire this
/// from a timer.
#[derive(Default)]
pub struct SearchInterrupt(AtomicBool);

impl SearchInterrupt {
	/// A fresh, un-fired interrupt.
	pub fn new() -> Self {
		SearchInterrupt(AtomicBool::new(false))
	}

	/// Makes the associated search return [`RoutingError::Interrupted`] at its next check.
	pub fn fire(&self) {
		self.0.store(true, Ordering::Release);
	}

	fn fired(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}
}

/// Which way value flows on the paths a search explores, relative to the search root.
///
/// This decides which endpoint's published policy governs each candidate edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaymentDirection {
	/// Explored paths carry value toward the root: the querying side pays.
	Outbound,
	/// Explored paths carry value away from the root toward the querying side.
	Inbound,
}

struct RouteGraphNode {
	node_id: NodeId,
	distance: u64,
	amount_msat: u64,
}

impl cmp::Ord for RouteGraphNode {
	fn cmp(&self, other: &RouteGraphNode) -> cmp::Ordering {
		// BinaryHeap is a max-heap, so compare backwards to pop the least-distance entry
		// first. The amount and node id keep equal-distance duplicates deterministically
		// ordered.
		other.distance.cmp(&self.distance)
			.then_with(|| other.amount_msat.cmp(&self.amount_msat))
			.then_with(|| other.node_id.cmp(&self.node_id))
	}
}

impl cmp::PartialOrd for RouteGraphNode {
	fn partial_cmp(&self, other: &RouteGraphNode) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl cmp::PartialEq for RouteGraphNode {
	fn eq(&self, other: &RouteGraphNode) -> bool {
		self.cmp(other) == cmp::Ordering::Equal
	}
}

impl cmp::Eq for RouteGraphNode {}

/// Finds payment paths over a [`NetworkGraph`].
///
/// A search is pure, blocking compute over the shared graph: any number may run concurrently,
/// and gossip writers are never blocked for the duration of one. The blacklist records
/// channels which recently failed so that retries route around them, and the beacon cache
/// (see [`crate::routing::beacons`]) amortizes repeated queries for similar amounts.
pub struct PathFinder<G: Deref<Target = NetworkGraph<L>>, L: Deref> where L::Target: Logger {
	network_graph: G,
	pub(super) logger: L,
	blacklist: RwLock<HashSet<ShortChannelId>>,
	pub(super) beacon_cache: RwLock<BeaconCache>,
}

impl<G: Deref<Target = NetworkGraph<L>>, L: Deref> PathFinder<G, L> where L::Target: Logger {
	/// Creates a `PathFinder` for the given network graph.
	pub fn new(network_graph: G, logger: L) -> Self {
		PathFinder {
			network_graph,
			logger,
			blacklist: RwLock::new(HashSet::new()),
			beacon_cache: RwLock::new(BeaconCache::default()),
		}
	}

	/// Gets a reference to the underlying [`NetworkGraph`] which was provided in
	/// [`PathFinder::new`].
	pub fn network_graph(&self) -> &G {
		&self.network_graph
	}

	/// Excludes a channel from all future searches, e.g. after it returned a transient
	/// failure for a payment attempt.
	pub fn add_to_blacklist(&self, short_channel_id: ShortChannelId) {
		log_info!(self.logger, "Blacklisting channel {}", short_channel_id);
		self.blacklist.write().unwrap().insert(short_channel_id);
	}

	/// Forgets all blacklisted channels.
	pub fn clear_blacklist(&self) {
		self.blacklist.write().unwrap().clear();
	}

	/// Heuristic cost of carrying `amount_msat` over the channel from `start` to `end`,
	/// returning `(cost, fee_msat)`, or `None` if the edge cannot be used at this amount.
	///
	/// With `ignore_costs` set (edges leaving the sender itself) the fee and time-lock terms
	/// are dropped: we charge ourselves nothing, and our own delay does not irritate us. The
	/// per-edge base cost still applies so short paths stay preferred.
	fn edge_cost(&self, short_channel_id: &ShortChannelId, start: &NodeId, end: &NodeId,
		amount_msat: u64, ignore_costs: bool, local_channels: &LocalChannels) -> Option<(u64, u64)>
	{
		let channel_info = self.network_graph.channel(short_channel_id, local_channels)?;
		let policy = self.network_graph.policy(short_channel_id, start, local_channels)?;
		if !policy.enabled {
			return None;
		}
		if amount_msat < policy.htlc_minimum_msat {
			return None; // payment amount too little
		}
		if let Some(capacity_sats) = channel_info.capacity_sats {
			if amount_msat / 1000 > capacity_sats {
				return None; // payment amount too large
			}
		}
		if let Some(htlc_maximum_msat) = policy.htlc_maximum_msat {
			if amount_msat > htlc_maximum_msat {
				return None; // payment amount too large
			}
		}
		let route_edge = RouteEdge::from_channel_policy(&policy, *short_channel_id, *end,
			self.network_graph.node_features(end));
		if !route_edge.is_sane_to_use(amount_msat) {
			return None; // thanks but no thanks
		}

		// Distance metric notes:
		// - Edges have a base cost (more edges -> more likely one will fail).
		// - The larger the payment amount, and the longer the CLTV, the more irritating it is
		//   if the HTLC gets stuck.
		// - Paying lower fees is better.
		if ignore_costs {
			return Some((PATH_HOP_BASE_COST_MSAT, 0));
		}
		let fee_msat = route_edge.fee_for_edge(amount_msat);
		let cltv_cost = (route_edge.cltv_expiry_delta as u128 * amount_msat as u128 * 15 / 1_000_000_000) as u64;
		Some((PATH_HOP_BASE_COST_MSAT.saturating_add(fee_msat).saturating_add(cltv_cost), fee_msat))
	}

	/// Runs the reverse-direction Dijkstra rooted at `target`, returning the predecessor map.
	///
	/// If `source` is given the search stops as soon as it is finalized; passing `None`
	/// explores everything reachable, which is what the beacon cache wants. No lock is held
	/// on the graph between steps: a racing gossip writer at worst costs the search a route.
	pub fn get_distances(&self, source: Option<&NodeId>, target: &NodeId, invoice_amount_msat: u64,
		direction: PaymentDirection, local_channels: &LocalChannels, interrupt: Option<&SearchInterrupt>)
		-> Result<PredecessorMap, RoutingError>
	{
		let blacklist = self.blacklist.read().unwrap().clone();
		let mut distances: HashMap<NodeId, u64> = HashMap::new();
		let mut prev_node: PredecessorMap = HashMap::new();
		let mut nodes_to_explore: BinaryHeap<RouteGraphNode> = BinaryHeap::new();
		distances.insert(*target, 0);
		nodes_to_explore.push(RouteGraphNode { node_id: *target, distance: 0, amount_msat: invoice_amount_msat });

		while let Some(RouteGraphNode { node_id: edge_end_node, distance, amount_msat }) = nodes_to_explore.pop() {
			if let Some(interrupt) = interrupt {
				if interrupt.fired() {
					log_trace!(self.logger, "Path search toward {} interrupted after reaching {} nodes", target, prev_node.len());
					return Err(RoutingError::Interrupted);
				}
			}
			if source == Some(&edge_end_node) {
				break;
			}
			// The heap has no decrease-key: relaxations push duplicate entries instead, and
			// the stale ones are dropped here when popped.
			if distances.get(&edge_end_node) != Some(&distance) {
				continue;
			}
			for short_channel_id in self.network_graph.channels_for_node(&edge_end_node, local_channels) {
				if blacklist.contains(&short_channel_id) {
					continue;
				}
				let channel_info = match self.network_graph.channel(&short_channel_id, local_channels) {
					Some(channel_info) => channel_info,
					None => continue, // raced a gossip writer; the channel is gone
				};
				let edge_start_node = match channel_info.other_node(&edge_end_node) {
					Some(node_id) => *node_id,
					None => {
						debug_assert!(false, "channels_for_node returned a channel not incident to the node");
						log_error!(self.logger, "Graph inconsistency: channel {} does not link node {}", short_channel_id, edge_end_node);
						continue;
					},
				};
				if let Some(local_channel) = local_channels.get(&short_channel_id) {
					if source == Some(&edge_start_node) {
						// Payment outgoing, on our channel.
						if !local_channel.can_pay(amount_msat, true) {
							continue;
						}
					} else if source == Some(&edge_end_node) {
						// Payment incoming, on our channel (cycling back through us).
						if !local_channel.can_receive(amount_msat, true) {
							continue;
						}
					}
				}
				let (policy_source, policy_target) = match direction {
					PaymentDirection::Outbound => (&edge_start_node, &edge_end_node),
					PaymentDirection::Inbound => (&edge_end_node, &edge_start_node),
				};
				let ignore_costs = source == Some(&edge_start_node);
				let (edge_cost, fee_for_edge_msat) = match self.edge_cost(&short_channel_id,
					policy_source, policy_target, amount_msat, ignore_costs, local_channels)
				{
					Some(cost_and_fee) => cost_and_fee,
					None => continue, // edge inadmissible at this amount
				};
				let alt_distance = distance.saturating_add(edge_cost);
				if alt_distance < distances.get(&edge_start_node).copied().unwrap_or(u64::max_value()) {
					distances.insert(edge_start_node, alt_distance);
					prev_node.insert(edge_start_node, (edge_end_node, short_channel_id));
					nodes_to_explore.push(RouteGraphNode {
						node_id: edge_start_node,
						distance: alt_distance,
						amount_msat: amount_msat.saturating_add(fee_for_edge_msat),
					});
				}
			}
		}

		log_trace!(self.logger, "Search rooted at {} reached {} nodes", target, prev_node.len());
		Ok(prev_node)
	}

	/// Backtracks a predecessor map into a path from `node_a` to `node_b`, or `None` if the
	/// map never reached `node_a`.
	pub fn get_path(node_a: &NodeId, node_b: &NodeId, prev_node: &PredecessorMap) -> Option<PaymentPath> {
		if !prev_node.contains_key(node_a) {
			return None; // no path found
		}
		let mut path = Vec::new();
		let mut edge_start_node = *node_a;
		while edge_start_node != *node_b {
			let (edge_end_node, edge_taken) = match prev_node.get(&edge_start_node) {
				Some(hop) => *hop,
				None => return None,
			};
			path.push((edge_end_node, edge_taken));
			edge_start_node = edge_end_node;
		}
		Some(path)
	}

	/// Returns a path from `node_a` to `node_b` able to carry `invoice_amount_msat`, or
	/// `None` if the graph has no usable path.
	pub fn find_path_for_payment(&self, node_a: &NodeId, node_b: &NodeId, invoice_amount_msat: u64,
		local_channels: &LocalChannels) -> Option<PaymentPath>
	{
		let prev_node = self.get_distances(Some(node_a), node_b, invoice_amount_msat,
			PaymentDirection::Outbound, local_channels, None).ok()?;
		Self::get_path(node_a, node_b, &prev_node)
	}

	/// As [`Self::find_path_for_payment`], but polls `interrupt` between search steps so that
	/// a caller-side timeout can abandon the search.
	pub fn find_path_for_payment_interruptible(&self, node_a: &NodeId, node_b: &NodeId,
		invoice_amount_msat: u64, local_channels: &LocalChannels, interrupt: &SearchInterrupt)
		-> Result<PaymentPath, RoutingError>
	{
		let prev_node = self.get_distances(Some(node_a), node_b, invoice_amount_msat,
			PaymentDirection::Outbound, local_channels, Some(interrupt))?;
		Self::get_path(node_a, node_b, &prev_node).ok_or(RoutingError::NoPathFound)
	}

	/// Resolves a path into a [`PaymentRoute`], reading each hop's current policy and end-node
	/// features out of the graph.
	///
	/// Fails with [`RoutingError::NoChannelPolicy`] if a policy has vanished since the search
	/// ran, and with [`RoutingError::InvariantViolation`] if a hop's channel does not link the
	/// path's chain of nodes.
	pub fn create_route_from_path(&self, path: &PaymentPath, from_node_id: &NodeId,
		local_channels: &LocalChannels) -> Result<PaymentRoute, RoutingError>
	{
		let mut route = Vec::with_capacity(path.len());
		let mut prev_node_id = *from_node_id;
		for (node_id, short_channel_id) in path.iter() {
			if let Some(channel_info) = self.network_graph.channel(short_channel_id, local_channels) {
				match channel_info.other_node(&prev_node_id) {
					Some(other_node) if other_node == node_id => {},
					_ => {
						log_error!(self.logger, "Path hop {} does not link {} to {}", short_channel_id, prev_node_id, node_id);
						return Err(RoutingError::InvariantViolation);
					},
				}
			}
			let policy = match self.network_graph.policy(short_channel_id, &prev_node_id, local_channels) {
				Some(policy) => policy,
				None => return Err(RoutingError::NoChannelPolicy(*short_channel_id)),
			};
			route.push(RouteEdge::from_channel_policy(&policy, *short_channel_id, *node_id,
				self.network_graph.node_features(node_id)));
			prev_node_id = *node_id;
		}
		Ok(route)
	}

	/// Finds a path and resolves it into a route, rejecting any route which fails
	/// [`is_route_sane_to_use`] at the invoice amount.
	pub fn find_route(&self, node_a: &NodeId, node_b: &NodeId, invoice_amount_msat: u64,
		local_channels: &LocalChannels) -> Result<PaymentRoute, RoutingError>
	{
		let path = self.find_path_for_payment(node_a, node_b, invoice_amount_msat, local_channels)
			.ok_or(RoutingError::NoPathFound)?;
		let route = self.create_route_from_path(&path, node_a, local_channels)?;
		if !is_route_sane_to_use(&route, invoice_amount_msat, MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE) {
			log_warn!(self.logger, "Found a path to {} but the resulting route failed sanity checks", node_b);
			return Err(RoutingError::NoPathFound);
		}
		Ok(route)
	}
}
