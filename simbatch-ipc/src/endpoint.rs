//! Connection endpoint
//!
//! [`Connection`] owns one transport and implements every exchange used by
//! both sides: raw frames, labeled values, dictionary messages, commands and
//! the command-dispatch loop. Framing lives here once; the execution model
//! is chosen by the transport.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, trace};
use std::net::SocketAddr;

use crate::codec::{self, FrameLimits, Message, WireValue, SIZE_PREFIX_LEN};
use crate::command::Command;
use crate::error::IpcError;
use crate::field::{Field, FieldMap};
use crate::transport::FrameTransport;

/// Label of a named dictionary header
pub const DICT_NAME_LABEL: &str = "::dict::";

/// Label introducing a nested dictionary
pub const NESTED_DICT_LABEL: &str = "dict_id";

/// Label of a worker's first frame
pub const INSTANCE_ID_LABEL: &str = "instance_ID";

/// Label of the input sent with a prediction request
pub const PREDICTION_INPUT_LABEL: &str = "input";

/// Label of the coordinator's prediction reply
pub const PREDICTION_OUTPUT_LABEL: &str = "prediction";

/// One end of a half-duplex conversation
pub struct Connection<T> {
    transport: T,
    limits: FrameLimits,
    closed: bool,
}

macro_rules! send_command_fns {
    ($($name:ident => $command:ident),* $(,)?) => {
        $(
            #[doc = concat!("Send the `", stringify!($command), "` command")]
            pub async fn $name(&mut self) -> Result<(), IpcError> {
                self.send_command(Command::$command).await
            }
        )*
    };
}

impl<T: FrameTransport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            limits: FrameLimits::default(),
            closed: false,
        }
    }

    pub fn with_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &FrameLimits {
        &self.limits
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.transport.peer()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send one complete frame
    pub async fn send_message(&mut self, message: &Message) -> Result<(), IpcError> {
        let frame = codec::encode(message)?;
        self.write_frame(&frame).await
    }

    /// Send a value frame
    pub async fn send(&mut self, value: &WireValue) -> Result<(), IpcError> {
        let frame = codec::encode_value(value)?;
        self.write_frame(&frame).await
    }

    pub async fn send_command(&mut self, command: Command) -> Result<(), IpcError> {
        trace!("sending command {}", command);
        let frame = codec::encode_command(command)?;
        self.write_frame(&frame).await
    }

    send_command_fns! {
        send_command_exit => Exit,
        send_command_step => Step,
        send_command_done => Done,
        send_command_finished => Finished,
        send_command_prediction => Prediction,
        send_command_read => Read,
        send_command_sample => Sample,
        send_command_visualisation => Visualisation,
        send_command_compute => Compute,
        send_command_change_db => ChangeDb,
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), IpcError> {
        if self.closed {
            return Err(IpcError::ConnectionClosed);
        }
        self.transport.write_all(frame).await?;
        self.transport.flush().await
    }

    /// Read exactly one frame
    pub async fn receive(&mut self) -> Result<Message, IpcError> {
        if self.closed {
            return Err(IpcError::ConnectionClosed);
        }
        let head = self.transport.read_exact(SIZE_PREFIX_LEN).await?;
        let count = codec::size_from_prefix(&head)?;
        self.limits.check_parts(count)?;

        let table = self.transport.read_exact(count * SIZE_PREFIX_LEN).await?;
        let sizes = codec::parse_size_table(&table, count)?;
        let total = sizes.iter().fold(0usize, |acc, size| acc.saturating_add(*size));
        self.limits.check_frame(total)?;

        let mut parts = Vec::with_capacity(count);
        for size in sizes {
            parts.push(self.transport.read_exact(size).await?.freeze());
        }
        let message = codec::decode_with_limits(&parts, &self.limits)?;
        trace!("received {}", message.describe());
        Ok(message)
    }

    /// Read one frame that must be a value
    pub async fn receive_value(&mut self) -> Result<WireValue, IpcError> {
        match self.receive().await? {
            Message::Value(value) => Ok(value),
            other => Err(IpcError::unexpected("a value", other.describe())),
        }
    }

    pub async fn receive_text(&mut self) -> Result<String, IpcError> {
        match self.receive_value().await? {
            WireValue::Text(text) => Ok(text),
            other => Err(IpcError::unexpected("a text value", format!("{} value", other.kind_name()))),
        }
    }

    pub async fn receive_int(&mut self) -> Result<i64, IpcError> {
        match self.receive_value().await? {
            WireValue::Int(int) => Ok(int),
            other => Err(IpcError::unexpected("an int value", format!("{} value", other.kind_name()))),
        }
    }

    pub async fn receive_bool(&mut self) -> Result<bool, IpcError> {
        match self.receive_value().await? {
            WireValue::Bool(flag) => Ok(flag),
            other => Err(IpcError::unexpected("a bool value", format!("{} value", other.kind_name()))),
        }
    }

    /// Read one frame that must be `command`
    pub async fn expect_command(&mut self, command: Command) -> Result<(), IpcError> {
        match self.receive().await? {
            Message::Command(received) if received == command => Ok(()),
            other => Err(IpcError::unexpected(
                format!("command '{}'", command),
                other.describe(),
            )),
        }
    }

    /// Send a label then a value, optionally led by `read`
    pub async fn send_labeled(
        &mut self,
        label: &str,
        value: &WireValue,
        send_read_command: bool,
    ) -> Result<(), IpcError> {
        if send_read_command {
            self.send_command(Command::Read).await?;
        }
        self.send(&WireValue::Text(label.to_owned())).await?;
        self.send(value).await
    }

    /// Receive a label and its value. A leading command frame is skipped and
    /// the following frame is taken as the label.
    pub async fn receive_labeled(&mut self) -> Result<(String, WireValue), IpcError> {
        let first = self.receive().await?;
        self.finish_labeled(first).await
    }

    async fn finish_labeled(&mut self, first: Message) -> Result<(String, WireValue), IpcError> {
        let label_frame = match first {
            Message::Command(_) => self.receive().await?,
            other => other,
        };
        let label = match label_frame {
            Message::Value(WireValue::Text(label)) => label,
            other => return Err(IpcError::unexpected("a text label", other.describe())),
        };
        let value = self.receive_value().await?;
        Ok((label, value))
    }

    /// Send a dictionary message. An absent or empty map is a single `finished`.
    pub async fn send_dict(&mut self, name: &str, dict: Option<&FieldMap>) -> Result<(), IpcError> {
        match dict {
            Some(map) if !map.is_empty() => {
                debug!("sending dictionary '{}' ({} entries)", name, map.len());
                self.send_command(Command::Read).await?;
                self.send_labeled(DICT_NAME_LABEL, &WireValue::Text(name.to_owned()), true)
                    .await?;
                self.send_entries(map).await?;
                self.send_command(Command::Finished).await
            }
            _ => self.send_command(Command::Finished).await,
        }
    }

    fn send_entries<'a>(&'a mut self, map: &'a FieldMap) -> BoxFuture<'a, Result<(), IpcError>> {
        async move {
            for (key, field) in map {
                match field {
                    Field::Value(value) => self.send_labeled(key, value, true).await?,
                    Field::Map(nested) => {
                        self.send_labeled(NESTED_DICT_LABEL, &WireValue::Text(key.clone()), true)
                            .await?;
                        self.send_entries(nested).await?;
                    }
                }
            }
            self.send_command(Command::Finished).await
        }
        .boxed()
    }

    /// Receive a dictionary message into `target`, up to its `finished` token
    pub fn receive_dict<'a>(&'a mut self, target: &'a mut FieldMap) -> BoxFuture<'a, Result<(), IpcError>> {
        async move {
            loop {
                match self.receive().await? {
                    Message::Command(Command::Finished) => return Ok(()),
                    Message::Command(Command::Read) => {
                        let (label, value) = self.receive_labeled().await?;
                        self.store_labeled(target, label, value).await?;
                    }
                    other => {
                        return Err(IpcError::unexpected(
                            "'read' or 'finished'",
                            other.describe(),
                        ))
                    }
                }
            }
        }
        .boxed()
    }

    /// Receive one labeled value into `target`, following dictionary headers
    pub async fn receive_labeled_into(&mut self, target: &mut FieldMap) -> Result<(), IpcError> {
        let (label, value) = self.receive_labeled().await?;
        self.store_labeled(target, label, value).await
    }

    async fn store_labeled(
        &mut self,
        target: &mut FieldMap,
        label: String,
        value: WireValue,
    ) -> Result<(), IpcError> {
        if label == DICT_NAME_LABEL || label == NESTED_DICT_LABEL {
            let key = match value {
                WireValue::Text(key) => key,
                other => {
                    return Err(IpcError::unexpected(
                        "a dictionary name",
                        format!("{} value", other.kind_name()),
                    ))
                }
            };
            let mut nested = FieldMap::new();
            self.receive_dict(&mut nested).await?;
            target.insert(key, Field::Map(nested));
        } else {
            target.insert(label, Field::Value(value));
        }
        Ok(())
    }

    /// Dispatch incoming commands to `handler` until the peer sends `done`.
    /// A bare value where a command is expected is a protocol violation.
    pub async fn listen_while_not_done<H>(
        &mut self,
        handler: &mut H,
        data: &mut FieldMap,
        client_id: Option<u32>,
    ) -> Result<(), H::Error>
    where
        H: CommandHandler<T> + ?Sized,
    {
        loop {
            let command = match self.receive().await? {
                Message::Command(command) => command,
                other => {
                    return Err(IpcError::unexpected("a command", other.describe()).into());
                }
            };
            let ctx = CommandContext {
                conn: &mut *self,
                data: &mut *data,
                client_id,
            };
            match command {
                Command::Done => return Ok(()),
                Command::Exit => handler.on_exit(ctx).await?,
                Command::Step => handler.on_step(ctx).await?,
                Command::Finished => handler.on_finished(ctx).await?,
                Command::Prediction => handler.on_prediction(ctx).await?,
                Command::Read => handler.on_read(ctx).await?,
                Command::Sample => handler.on_sample(ctx).await?,
                Command::Visualisation => handler.on_visualisation(ctx).await?,
                Command::Compute => handler.on_compute(ctx).await?,
                Command::ChangeDb => handler.on_change_db(ctx).await?,
            }
            debug!("handled '{}' (client {:?})", command, client_id);
        }
    }

    /// Ask the coordinator for a network prediction over this connection
    pub async fn request_prediction(&mut self, input: &WireValue) -> Result<WireValue, IpcError> {
        self.send_command(Command::Prediction).await?;
        self.send_labeled(PREDICTION_INPUT_LABEL, input, false).await?;
        let (label, value) = self.receive_labeled().await?;
        if label != PREDICTION_OUTPUT_LABEL {
            return Err(IpcError::unexpected(
                format!("label '{}'", PREDICTION_OUTPUT_LABEL),
                format!("label '{}'", label),
            ));
        }
        Ok(value)
    }

    /// Shut the transport down. Later calls do nothing.
    pub async fn close(&mut self) -> Result<(), IpcError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport.shutdown().await
    }
}

/// State handed to a command handler
pub struct CommandContext<'a, T> {
    pub conn: &'a mut Connection<T>,
    pub data: &'a mut FieldMap,
    pub client_id: Option<u32>,
}

/// Reaction to each command received in [`Connection::listen_while_not_done`].
/// Every hook defaults to doing nothing, except `on_read`, which stores the
/// labeled value (or dictionary) that follows into `data`.
#[async_trait]
pub trait CommandHandler<T: FrameTransport>: Send {
    type Error: From<IpcError> + Send;

    async fn on_exit(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_step(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_finished(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_prediction(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_read(&mut self, ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        ctx.conn.receive_labeled_into(ctx.data).await?;
        Ok(())
    }

    async fn on_sample(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_visualisation(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_compute(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_change_db(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Handler that only keeps the default behavior
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl<T: FrameTransport> CommandHandler<T> for DefaultHandler {
    type Error = IpcError;
}
