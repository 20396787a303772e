// Copyright 2026 Chainscope contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

pub mod rpc;

use std::{pin::Pin, str::FromStr, sync::OnceLock};

use anyhow::{Context, Result};
use ethers::types::H256;
use futures::FutureExt;
use tokio_stream::Stream;

use crate::constants::ERC20_TRANSFER_TOPIC;

/// The shared ERC-20 ABI, loaded once.
pub fn erc20_abi() -> &'static ethers::abi::Abi {
	static ABI: OnceLock<ethers::abi::Abi> = OnceLock::new();
	ABI.get_or_init(|| {
		ethers::abi::Abi::load(include_bytes!("abis/ERC20.json").as_ref())
			.expect("bundled ERC20 ABI is valid")
	})
}

/// topic0 of `Transfer(address,address,uint256)`.
pub fn transfer_topic() -> H256 {
	static TOPIC: OnceLock<H256> = OnceLock::new();
	*TOPIC.get_or_init(|| {
		H256::from_str(ERC20_TRANSFER_TOPIC).expect("bundled topic constant is valid")
	})
}

/// Wraps a web3 crate subscription stream so it unsubscribes when dropped.
pub struct ConscientiousEvmWebsocketBlockHeaderStream {
	stream: Option<
		web3::api::SubscriptionStream<web3::transports::WebSocket, web3::types::BlockHeader>,
	>,
	chain_name: String,
}

impl ConscientiousEvmWebsocketBlockHeaderStream {
	pub async fn new(
		web3: web3::Web3<web3::transports::WebSocket>,
		chain_name: String,
	) -> Result<Self> {
		Ok(Self {
			stream: Some(
				web3.eth_subscribe()
					.subscribe_new_heads()
					.await
					.context("Failed to subscribe to new heads with WS client")?,
			),
			chain_name,
		})
	}
}

impl Drop for ConscientiousEvmWebsocketBlockHeaderStream {
	fn drop(&mut self) {
		tracing::warn!("Dropping the {} WS connection", self.chain_name);
		if let Some(stream) = self.stream.take() {
			let _ = stream.unsubscribe().now_or_never();
		}
	}
}

impl Stream for ConscientiousEvmWebsocketBlockHeaderStream {
	type Item = Result<web3::types::BlockHeader, web3::Error>;

	fn poll_next(
		mut self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Option<Self::Item>> {
		Pin::new(self.stream.as_mut().expect("stream only taken in Drop")).poll_next(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn erc20_abi_has_the_events_and_views_we_decode() {
		let abi = erc20_abi();
		assert!(abi.function("balanceOf").is_ok());
		assert!(abi.function("decimals").is_ok());
		assert!(abi.function("symbol").is_ok());
		assert!(abi.function("name").is_ok());
		assert!(abi.event("Transfer").is_ok());
	}

	#[test]
	fn transfer_topic_matches_the_abi_signature() {
		let from_abi = erc20_abi().event("Transfer").unwrap().signature();
		assert_eq!(transfer_topic(), from_abi);
	}
}
