//! Micro-batching for point reads.
//!
//! Requests arriving within `window` of the first one (or until `max_size` accumulate)
//! are handed to the executor as one batch. The executor returns one result per key, in
//! key order; the batcher fans them back out to the callers in the same order.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};

use crate::errors::RpcError;

type BatchFuture<V> = Pin<Box<dyn Future<Output = Vec<Result<V, RpcError>>> + Send>>;
type BatchExecutor<K, V> = Arc<dyn Fn(Vec<K>) -> BatchFuture<V> + Send + Sync>;

struct BatchRequest<K, V> {
	key: K,
	reply: oneshot::Sender<Result<V, RpcError>>,
}

#[derive(Clone)]
pub struct Batcher<K, V> {
	request_sender: mpsc::Sender<BatchRequest<K, V>>,
}

impl<K: Send + 'static, V: Send + 'static> Batcher<K, V> {
	pub fn new(window: Duration, max_size: usize, executor: BatchExecutor<K, V>) -> Self {
		assert!(max_size > 0, "batch size must be non-zero");
		let (request_sender, request_receiver) = mpsc::channel(max_size.max(16));

		tokio::spawn(run_batch_loop(request_receiver, window, max_size, executor));

		Self { request_sender }
	}

	/// Submits one read. Resolves when the batch containing it completes. Fails with
	/// `Cancelled` if the batcher has shut down.
	pub async fn submit(&self, key: K) -> Result<V, RpcError> {
		let (reply, response) = oneshot::channel();
		self.request_sender
			.send(BatchRequest { key, reply })
			.await
			.map_err(|_| RpcError::Cancelled)?;
		response.await.unwrap_or(Err(RpcError::Cancelled))
	}
}

async fn run_batch_loop<K, V>(
	mut request_receiver: mpsc::Receiver<BatchRequest<K, V>>,
	window: Duration,
	max_size: usize,
	executor: BatchExecutor<K, V>,
) {
	// The loop ends when every Batcher handle is dropped.
	while let Some(first) = request_receiver.recv().await {
		let mut batch = vec![first];

		// The window opens with the first request of the batch.
		let deadline = tokio::time::sleep(window);
		tokio::pin!(deadline);
		while batch.len() < max_size {
			tokio::select! {
				() = &mut deadline => break,
				next = request_receiver.recv() => match next {
					Some(request) => batch.push(request),
					None => break,
				},
			}
		}

		let (keys, replies): (Vec<_>, Vec<_>) =
			batch.into_iter().map(|request| (request.key, request.reply)).unzip();

		let batch_len = keys.len();
		let mut results = executor(keys).await;
		if results.len() != batch_len {
			tracing::error!(
				"batch executor returned {} results for {batch_len} requests",
				results.len()
			);
			results = (0..batch_len).map(|_| Err(RpcError::Cancelled)).collect();
		}

		for (reply, result) in replies.into_iter().zip(results) {
			// A caller that gave up on the batch is fine to ignore.
			let _ = reply.send(result);
		}
	}
}
