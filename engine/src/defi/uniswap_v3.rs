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

//! Uniswap V3 adapter: enumerates a holder's position NFTs, derives each pool address
//! via CREATE2, and splits position liquidity into token amounts with the canonical
//! Q64.96 tick math.

use std::{str::FromStr, sync::Arc, sync::OnceLock};

use async_trait::async_trait;
use ethers::{
	abi::Token as AbiToken,
	types::{H160, H256, U256, U512},
	utils::keccak256,
};

use crate::{
	adapter::ChainAdapter,
	constants::{UNISWAP_V3_FACTORY, UNISWAP_V3_POOL_INIT_CODE_HASH},
	defi::{LendingPosition, LiquidityPosition, ProtocolAdapter, StakedPosition},
	errors::RpcError,
	evm::rpc::ChainRpcApi,
	types::ChainId,
};

pub const MIN_TICK: i32 = -887272;
pub const MAX_TICK: i32 = 887272;

/// Canonical Uniswap NonfungiblePositionManager, deployed at the same address on every
/// supported chain.
const POSITION_MANAGER: &str = "0xC36442b4a4522E871399CD717aBDD847Ab11FE88";

const SUPPORTED_CHAINS: &[ChainId] = &[1, 10, 137, 8453, 42161];

fn position_manager_abi() -> &'static ethers::abi::Abi {
	static ABI: OnceLock<ethers::abi::Abi> = OnceLock::new();
	ABI.get_or_init(|| {
		ethers::abi::Abi::load(include_bytes!("abis/NonfungiblePositionManager.json").as_ref())
			.expect("bundled position manager ABI is valid")
	})
}

fn pool_abi() -> &'static ethers::abi::Abi {
	static ABI: OnceLock<ethers::abi::Abi> = OnceLock::new();
	ABI.get_or_init(|| {
		ethers::abi::Abi::load(include_bytes!("abis/UniswapV3Pool.json").as_ref())
			.expect("bundled pool ABI is valid")
	})
}

// ======= Tick math =======

/// `sqrt(1.0001^tick) * 2^96`, the canonical fixed-point square-root price.
pub fn sqrt_price_x96_at_tick(tick: i32) -> U256 {
	assert!((MIN_TICK..=MAX_TICK).contains(&tick), "tick {tick} out of range");
	let abs_tick = tick.unsigned_abs();

	// Per-bit multipliers for sqrt(1/1.0001^(2^i)) in Q128.128.
	const STEPS: [(u32, &str); 19] = [
		(0x2, "fff97272373d413259a46990580e213a"),
		(0x4, "fff2e50f5f656932ef12357cf3c7fdcc"),
		(0x8, "ffe5caca7e10e4e61c3624eaa0941cd0"),
		(0x10, "ffcb9843d60f6159c9db58835c926644"),
		(0x20, "ff973b41fa98c081472e6896dfb254c0"),
		(0x40, "ff2ea16466c96a3843ec78b326b52861"),
		(0x80, "fe5dee046a99a2a811c461f1969c3053"),
		(0x100, "fcbe86c7900a88aedcffc83b479aa3a4"),
		(0x200, "f987a7253ac413176f2b074cf7815e54"),
		(0x400, "f3392b0822b70005940c7a398e4b70f3"),
		(0x800, "e7159475a2c29b7443b29c7fa6e889d9"),
		(0x1000, "d097f3bdfd2022b8845ad8f792aa5825"),
		(0x2000, "a9f746462d870fdf8a65dc1f90e061e5"),
		(0x4000, "70d869a156d2a1b890bb3df62baf32f7"),
		(0x8000, "31be135f97d08fd981231505542fcfa6"),
		(0x10000, "9aa508b5b7a84e1c677de54f3e99bc9"),
		(0x20000, "5d6af8dedb81196699c329225ee604"),
		(0x40000, "2216e584f5fa1ea926041bedfe98"),
		(0x80000, "48a170391f7dc42444e8fa2"),
	];

	let mut ratio = if abs_tick & 0x1 != 0 {
		U256::from_str_radix("fffcb933bd6fad37aa2d162d1a594001", 16)
			.expect("valid constant")
	} else {
		U256::one() << 128
	};

	for (mask, multiplier) in STEPS {
		if abs_tick & mask != 0 {
			let multiplier =
				U256::from_str_radix(multiplier, 16).expect("valid constant");
			let wide = ratio.full_mul(multiplier) >> 128;
			ratio = U256::try_from(wide).expect("product shifted back below 2^256");
		}
	}

	if tick > 0 {
		ratio = U256::MAX / ratio;
	}

	// Q128.128 → Q64.96, rounding up.
	let low_bits_mask = (U256::one() << 32) - U256::one();
	(ratio >> 32) +
		if (ratio & low_bits_mask).is_zero() { U256::zero() } else { U256::one() }
}

/// `floor(a * b / denominator)` without intermediate overflow, saturating at
/// `U256::MAX`.
fn mul_div(a: U256, b: U256, denominator: U256) -> U256 {
	let wide = a.full_mul(b) / U512::from(denominator);
	U256::try_from(wide).unwrap_or(U256::MAX)
}

/// Token0 owed for `liquidity` between two sqrt prices.
pub fn amount0_delta(sqrt_a: U256, sqrt_b: U256, liquidity: u128) -> U256 {
	let (lower, upper) = if sqrt_a <= sqrt_b { (sqrt_a, sqrt_b) } else { (sqrt_b, sqrt_a) };
	if lower.is_zero() {
		return U256::zero()
	}
	let numerator1 = U256::from(liquidity) << 96;
	let numerator2 = upper - lower;
	mul_div(numerator1, numerator2, upper) / lower
}

/// Token1 owed for `liquidity` between two sqrt prices.
pub fn amount1_delta(sqrt_a: U256, sqrt_b: U256, liquidity: u128) -> U256 {
	let (lower, upper) = if sqrt_a <= sqrt_b { (sqrt_a, sqrt_b) } else { (sqrt_b, sqrt_a) };
	mul_div(U256::from(liquidity), upper - lower, U256::one() << 96)
}

/// Splits a position's liquidity into current token amounts.
///
/// Entirely token0 below the range, entirely token1 at or above it, and a mix of both
/// while the current tick sits inside.
pub fn position_amounts(
	liquidity: u128,
	current_tick: i32,
	tick_lower: i32,
	tick_upper: i32,
) -> (U256, U256) {
	assert!(tick_lower < tick_upper, "inverted tick range");
	let sqrt_lower = sqrt_price_x96_at_tick(tick_lower);
	let sqrt_upper = sqrt_price_x96_at_tick(tick_upper);

	if current_tick < tick_lower {
		(amount0_delta(sqrt_lower, sqrt_upper, liquidity), U256::zero())
	} else if current_tick >= tick_upper {
		(U256::zero(), amount1_delta(sqrt_lower, sqrt_upper, liquidity))
	} else {
		let sqrt_current = sqrt_price_x96_at_tick(current_tick);
		(
			amount0_delta(sqrt_current, sqrt_upper, liquidity),
			amount1_delta(sqrt_lower, sqrt_current, liquidity),
		)
	}
}

/// Derives the pool address for a token pair and fee tier via CREATE2.
pub fn pool_address(factory: H160, token_a: H160, token_b: H160, fee: u32) -> H160 {
	let (token0, token1) = if token_a < token_b { (token_a, token_b) } else { (token_b, token_a) };

	let salt = keccak256(ethers::abi::encode(&[
		AbiToken::Address(token0),
		AbiToken::Address(token1),
		AbiToken::Uint(U256::from(fee)),
	]));
	let init_code_hash =
		H256::from_str(UNISWAP_V3_POOL_INIT_CODE_HASH).expect("valid constant");

	let mut preimage = Vec::with_capacity(1 + 20 + 32 + 32);
	preimage.push(0xff);
	preimage.extend_from_slice(factory.as_bytes());
	preimage.extend_from_slice(&salt);
	preimage.extend_from_slice(init_code_hash.as_bytes());

	H160::from_slice(&keccak256(preimage)[12..])
}

// ======= Adapter =======

pub struct UniswapV3Adapter<Rpc: ChainRpcApi> {
	adapter: Arc<ChainAdapter<Rpc>>,
	factory: H160,
	position_manager: H160,
}

impl<Rpc: ChainRpcApi> UniswapV3Adapter<Rpc> {
	pub fn new(adapter: Arc<ChainAdapter<Rpc>>) -> Self {
		Self {
			adapter,
			factory: H160::from_str(UNISWAP_V3_FACTORY).expect("valid constant"),
			position_manager: H160::from_str(POSITION_MANAGER).expect("valid constant"),
		}
	}

	async fn read_uint(
		&self,
		contract: H160,
		function: &str,
		args: &[AbiToken],
	) -> Result<U256, RpcError> {
		match self
			.adapter
			.read_contract(contract, position_manager_abi(), function, args)
			.await?
			.first()
		{
			Some(AbiToken::Uint(value)) => Ok(*value),
			other => Err(RpcError::data(
				self.adapter.chain(),
				format!("{function} returned {other:?}"),
			)),
		}
	}

	async fn current_tick(&self, pool: H160) -> Result<i32, RpcError> {
		let outputs = self.adapter.read_contract(pool, pool_abi(), "slot0", &[]).await?;
		match outputs.get(1) {
			Some(AbiToken::Int(value)) => Ok(int24_from_token(*value)),
			other => Err(RpcError::data(
				self.adapter.chain(),
				format!("slot0 returned {other:?} for tick"),
			)),
		}
	}
}

/// Sign-extended int24 arrives as a two's-complement U256; truncating to 32 bits
/// recovers the signed value.
fn int24_from_token(value: U256) -> i32 {
	value.low_u32() as i32
}

#[async_trait]
impl<Rpc: ChainRpcApi> ProtocolAdapter for UniswapV3Adapter<Rpc> {
	fn protocol_name(&self) -> &'static str {
		"uniswap-v3"
	}

	// One adapter instance exists per configured chain; it only answers for the chain
	// whose transport it holds.
	fn supports_chain(&self, chain: ChainId) -> bool {
		chain == self.adapter.chain() && SUPPORTED_CHAINS.contains(&chain)
	}

	async fn get_lending_positions(
		&self,
		_address: H160,
		_chain: ChainId,
	) -> Result<Vec<LendingPosition>, RpcError> {
		Ok(vec![])
	}

	async fn get_staked_positions(
		&self,
		_address: H160,
		_chain: ChainId,
	) -> Result<Vec<StakedPosition>, RpcError> {
		Ok(vec![])
	}

	async fn get_liquidity_positions(
		&self,
		address: H160,
		chain: ChainId,
	) -> Result<Vec<LiquidityPosition>, RpcError> {
		if !self.supports_chain(chain) {
			return Ok(vec![])
		}

		let held = self
			.read_uint(self.position_manager, "balanceOf", &[AbiToken::Address(address)])
			.await?
			.as_u64();

		let mut positions = Vec::new();
		for index in 0..held {
			let token_id = self
				.read_uint(
					self.position_manager,
					"tokenOfOwnerByIndex",
					&[AbiToken::Address(address), AbiToken::Uint(index.into())],
				)
				.await?;

			let fields = self
				.adapter
				.read_contract(
					self.position_manager,
					position_manager_abi(),
					"positions",
					&[AbiToken::Uint(token_id)],
				)
				.await?;

			let (
				Some(AbiToken::Address(token0)),
				Some(AbiToken::Address(token1)),
				Some(AbiToken::Uint(fee)),
				Some(AbiToken::Int(tick_lower)),
				Some(AbiToken::Int(tick_upper)),
				Some(AbiToken::Uint(liquidity)),
			) = (
				fields.get(2),
				fields.get(3),
				fields.get(4),
				fields.get(5),
				fields.get(6),
				fields.get(7),
			)
			else {
				return Err(RpcError::data(
					chain,
					format!("undecodable positions({token_id}) response"),
				))
			};

			let liquidity = liquidity.as_u128();
			if liquidity == 0 {
				continue
			}

			let tick_lower = int24_from_token(*tick_lower);
			let tick_upper = int24_from_token(*tick_upper);
			let fee = fee.as_u32();

			let pool = pool_address(self.factory, *token0, *token1, fee);
			let current_tick = self.current_tick(pool).await?;
			let (amount0, amount1) =
				position_amounts(liquidity, current_tick, tick_lower, tick_upper);

			positions.push(LiquidityPosition {
				protocol: self.protocol_name().to_string(),
				chain,
				pool,
				token0: self.adapter.token_metadata(*token0).await?,
				token1: self.adapter.token_metadata(*token1).await?,
				fee_tier: fee,
				tick_lower,
				tick_upper,
				liquidity: liquidity.to_string(),
				amount0: amount0.to_string(),
				amount1: amount1.to_string(),
				in_range: (tick_lower..tick_upper).contains(&current_tick),
			});
		}

		Ok(positions)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn u256_to_f64(value: U256) -> f64 {
		value.to_string().parse::<f64>().expect("decimal string parses")
	}

	#[test]
	fn sqrt_price_at_tick_zero_is_exactly_q96() {
		assert_eq!(sqrt_price_x96_at_tick(0), U256::one() << 96);
	}

	#[test]
	fn sqrt_price_matches_float_model() {
		let q96 = (2f64).powi(96);
		for tick in (-200_000..=200_000).step_by(9_999) {
			let exact = u256_to_f64(sqrt_price_x96_at_tick(tick));
			let model = q96 * 1.0001_f64.powf(tick as f64 / 2.0);
			let relative_error = ((exact - model) / model).abs();
			assert!(relative_error < 1e-6, "tick {tick}: {exact} vs {model}");
		}
	}

	#[test]
	fn sqrt_price_is_strictly_monotonic() {
		let mut previous = sqrt_price_x96_at_tick(MIN_TICK);
		for tick in [-887000, -100000, -60, -1, 0, 1, 60, 100000, 887000] {
			let current = sqrt_price_x96_at_tick(tick);
			assert!(current > previous, "tick {tick}");
			previous = current;
		}
	}

	#[test]
	fn in_range_position_splits_between_both_tokens() {
		let (amount0, amount1) = position_amounts(10u128.pow(18), 0, -60, 60);
		assert!(!amount0.is_zero());
		assert!(!amount1.is_zero());

		// Symmetric range around the current tick splits roughly evenly.
		let ratio = u256_to_f64(amount0) / u256_to_f64(amount1);
		assert!((0.99..1.01).contains(&ratio), "ratio {ratio}");
	}

	#[test]
	fn below_range_is_all_token0() {
		let (amount0, amount1) = position_amounts(10u128.pow(18), -120, -60, 60);
		assert!(!amount0.is_zero());
		assert!(amount1.is_zero());
	}

	#[test]
	fn at_or_above_range_is_all_token1() {
		for current in [60, 61, 1_000] {
			let (amount0, amount1) = position_amounts(10u128.pow(18), current, -60, 60);
			assert!(amount0.is_zero(), "current {current}");
			assert!(!amount1.is_zero(), "current {current}");
		}
	}

	#[test]
	fn widening_the_range_increases_both_amounts() {
		let liquidity = 10u128.pow(18);
		let (narrow0, narrow1) = position_amounts(liquidity, 0, -60, 60);
		let (wide0, wide1) = position_amounts(liquidity, 0, -120, 120);
		assert!(wide0 > narrow0);
		assert!(wide1 > narrow1);
	}

	#[test]
	fn amounts_scale_with_liquidity() {
		let (one0, one1) = position_amounts(10u128.pow(18), 0, -60, 60);
		let (ten0, ten1) = position_amounts(10u128.pow(19), 0, -60, 60);
		// Within rounding, 10x the liquidity is 10x each amount.
		assert!(ten0 >= one0 * 9 && ten0 <= one0 * 11);
		assert!(ten1 >= one1 * 9 && ten1 <= one1 * 11);
	}

	#[test]
	fn pool_address_matches_the_canonical_usdc_weth_pool() {
		let factory = H160::from_str(UNISWAP_V3_FACTORY).unwrap();
		let usdc = H160::from_str("0xA0b86991c6218b36c1d19d4a2e9eb0ce3606eB48").unwrap();
		let weth = H160::from_str("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2").unwrap();

		let pool = pool_address(factory, usdc, weth, 500);
		assert_eq!(
			pool,
			H160::from_str("0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640").unwrap()
		);

		// Argument order must not matter.
		assert_eq!(pool, pool_address(factory, weth, usdc, 500));
	}

	#[test]
	fn int24_round_trip() {
		// -60 sign-extended into a U256.
		let negative = U256::MAX - U256::from(59);
		assert_eq!(int24_from_token(negative), -60);
		assert_eq!(int24_from_token(U256::from(887_272)), 887_272);
	}
}
