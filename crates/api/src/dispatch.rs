use tokio::sync::mpsc::{self, Sender};
use tracing::{error, instrument, trace};

use crate::{
	commands::{ApiCommand, ApiResponse, ConnectionCommand, SyncCommand},
	error::ApiError,
};

pub type ApiSendWithReply = (ApiCommand, Sender<Result<ApiResponse, ApiError>>);

/// A clonable api handle
#[derive(Debug, Clone)]
pub struct ApiDispatch {
	pub(crate) tx: Sender<ApiSendWithReply>,
}

impl ApiDispatch {
	#[instrument(skip(self))]
	pub async fn dispatch(&self, command: ApiCommand) -> Result<ApiResponse, ApiError> {
		let (reply_tx, mut reply_rx) = mpsc::channel(1);
		trace!(?command, "Dispatch command to api");
		self.tx.clone().send((command, reply_tx)).await?;

		let reply = reply_rx.recv().await;

		if let Some(Err(ref error)) = reply {
			error!(?error, "Api dispatch");
		}

		reply.ok_or(ApiError::ApiShutdownRx)?
	}

	pub async fn connection(&self, command: ConnectionCommand) -> Result<ApiResponse, ApiError> {
		self.dispatch(ApiCommand::Connection(command)).await
	}

	pub async fn sync(&self, command: SyncCommand) -> Result<ApiResponse, ApiError> {
		self.dispatch(ApiCommand::Sync(command)).await
	}
}
