//! Command Outputs
//!
//! An output receives a reply as a stream of primitives (`set_bytes`,
//! `set_status`, `set_integer`, plus `multi`/`complete` around arrays) and
//! turns it into the command's typed result. [`decode_reply`] walks a parsed
//! [`RespValue`] and feeds it to an output.
//!
//! List-shaped outputs hand each element to a [`Subscriber`]. The default
//! subscriber, [`ListSubscriber`], appends to the list returned as the
//! command result; a caller-supplied subscriber can consume large replies
//! element by element instead.

use super::CommandError;
use crate::protocol::RespValue;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};

/// Decodes reply primitives into a typed result.
pub trait CommandOutput: Send {
    type Output: Send + 'static;

    /// A bulk string, or `None` for a nil reply or nil array element.
    fn set_bytes(&mut self, bytes: Option<Bytes>);

    fn set_status(&mut self, status: &str) {
        self.set_bytes(Some(Bytes::copy_from_slice(status.as_bytes())));
    }

    fn set_integer(&mut self, value: i64) {
        self.set_bytes(Some(Bytes::from(value.to_string())));
    }

    /// An array of `count` elements follows.
    fn multi(&mut self, count: usize) {
        let _ = count;
    }

    /// The array opened at `depth` is finished.
    fn complete(&mut self, depth: usize) {
        let _ = depth;
    }

    /// Produces the result once the reply is fully decoded.
    fn finish(self: Box<Self>) -> Self::Output;
}

/// Feeds `reply` into `output`.
///
/// Returns the message of the first error reply found at any depth; the
/// command is then failed with it instead of completing.
pub fn decode_reply<O>(reply: RespValue, output: &mut O) -> Result<(), String>
where
    O: CommandOutput + ?Sized,
{
    decode_at(reply, output, 0)
}

fn decode_at<O>(value: RespValue, output: &mut O, depth: usize) -> Result<(), String>
where
    O: CommandOutput + ?Sized,
{
    match value {
        RespValue::SimpleString(status) => output.set_status(&status),
        RespValue::Error(message) => return Err(message),
        RespValue::Integer(n) => output.set_integer(n),
        RespValue::BulkString(data) => output.set_bytes(Some(data)),
        RespValue::Null => output.set_bytes(None),
        RespValue::Array(items) => {
            output.multi(items.len());
            for item in items {
                decode_at(item, output, depth + 1)?;
            }
            output.complete(depth);
        }
    }
    Ok(())
}

/// Status reply such as `OK`.
#[derive(Debug, Default)]
pub struct StatusOutput {
    status: String,
}

impl StatusOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandOutput for StatusOutput {
    type Output = String;

    fn set_bytes(&mut self, bytes: Option<Bytes>) {
        self.status = bytes.map(decode_ascii).unwrap_or_default();
    }

    fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    fn finish(self: Box<Self>) -> String {
        self.status
    }
}

/// Integer reply.
#[derive(Debug, Default)]
pub struct IntegerOutput {
    value: i64,
}

impl IntegerOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandOutput for IntegerOutput {
    type Output = i64;

    fn set_bytes(&mut self, bytes: Option<Bytes>) {
        if let Some(n) = bytes
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
        {
            self.value = n;
        }
    }

    fn set_integer(&mut self, value: i64) {
        self.value = value;
    }

    fn finish(self: Box<Self>) -> i64 {
        self.value
    }
}

/// Single value that may be nil, e.g. the reply to `GET`.
#[derive(Debug, Default)]
pub struct ValueOutput {
    value: Option<Bytes>,
}

impl ValueOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandOutput for ValueOutput {
    type Output = Option<Bytes>;

    fn set_bytes(&mut self, bytes: Option<Bytes>) {
        self.value = bytes;
    }

    fn finish(self: Box<Self>) -> Option<Bytes> {
        self.value
    }
}

/// Rebuilds the reply as a [`RespValue`]. Useful when the shape of the reply
/// is not known up front.
#[derive(Debug, Default)]
pub struct RespOutput {
    open: Vec<(Vec<RespValue>, usize)>,
    root: Option<RespValue>,
}

impl RespOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mut value: RespValue) {
        loop {
            if let Some((items, expected)) = self.open.last_mut() {
                items.push(value);
                if items.len() < *expected {
                    return;
                }
            } else {
                self.root = Some(value);
                return;
            }
            match self.open.pop() {
                Some((items, _)) => value = RespValue::Array(items),
                None => return,
            }
        }
    }
}

impl CommandOutput for RespOutput {
    type Output = RespValue;

    fn set_bytes(&mut self, bytes: Option<Bytes>) {
        self.push(bytes.map_or(RespValue::Null, RespValue::BulkString));
    }

    fn set_status(&mut self, status: &str) {
        self.push(RespValue::simple_string(status));
    }

    fn set_integer(&mut self, value: i64) {
        self.push(RespValue::Integer(value));
    }

    fn multi(&mut self, count: usize) {
        if count == 0 {
            self.push(RespValue::Array(Vec::new()));
        } else {
            self.open.push((Vec::with_capacity(count), count));
        }
    }

    fn finish(self: Box<Self>) -> RespValue {
        self.root.unwrap_or(RespValue::Null)
    }
}

/// Receives list elements as they are decoded. `None` is a nil element.
///
/// Closures taking `Option<T>` are subscribers.
pub trait Subscriber<T>: Send {
    fn on_next(&mut self, element: Option<T>);
}

impl<T, F> Subscriber<T> for F
where
    F: FnMut(Option<T>) + Send,
{
    fn on_next(&mut self, element: Option<T>) {
        self(element)
    }
}

/// The default subscriber: appends every element, nil included, to a shared
/// list.
#[derive(Debug)]
pub struct ListSubscriber<T> {
    target: Arc<Mutex<Vec<Option<T>>>>,
}

impl<T> ListSubscriber<T> {
    pub fn new() -> Self {
        Self::of(Arc::new(Mutex::new(Vec::new())))
    }

    /// Appends into `target`.
    pub fn of(target: Arc<Mutex<Vec<Option<T>>>>) -> Self {
        Self { target }
    }

    /// Takes the elements collected so far.
    pub fn take(&self) -> Vec<Option<T>> {
        std::mem::take(&mut *self.target.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<T> Default for ListSubscriber<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Subscriber<T> for ListSubscriber<T> {
    fn on_next(&mut self, element: Option<T>) {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(element);
    }
}

/// Outputs that stream their elements to a replaceable subscriber.
pub trait StreamingOutput<T> {
    /// Replaces the subscriber. `None` is rejected with
    /// [`CommandError::InvalidArgument`] and leaves the current one in place.
    fn set_subscriber(
        &mut self,
        subscriber: Option<Box<dyn Subscriber<T>>>,
    ) -> Result<(), CommandError>;
}

/// List reply whose elements are decoded one at a time and streamed to a
/// subscriber.
pub struct ListOutput<T> {
    collected: ListSubscriber<T>,
    subscriber: Box<dyn Subscriber<T>>,
    decode: fn(Bytes) -> T,
}

/// List of raw values, e.g. the reply to `MGET` or `LRANGE`.
pub type ValueListOutput = ListOutput<Bytes>;

/// List of strings, e.g. the reply to `KEYS` or `CONFIG GET`.
pub type StringListOutput = ListOutput<String>;

impl<T: Send + 'static> ListOutput<T> {
    fn with_decoder(decode: fn(Bytes) -> T) -> Self {
        let target = Arc::new(Mutex::new(Vec::new()));
        Self {
            collected: ListSubscriber::of(Arc::clone(&target)),
            subscriber: Box::new(ListSubscriber::of(target)),
            decode,
        }
    }
}

impl ListOutput<Bytes> {
    pub fn new() -> Self {
        Self::with_decoder(|bytes| bytes)
    }
}

impl Default for ListOutput<Bytes> {
    fn default() -> Self {
        Self::new()
    }
}

impl ListOutput<String> {
    pub fn new() -> Self {
        Self::with_decoder(decode_ascii)
    }
}

impl Default for ListOutput<String> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CommandOutput for ListOutput<T> {
    type Output = Vec<Option<T>>;

    fn set_bytes(&mut self, bytes: Option<Bytes>) {
        let element = bytes.map(self.decode);
        self.subscriber.on_next(element);
    }

    /// Empty when a custom subscriber consumed the elements.
    fn finish(self: Box<Self>) -> Vec<Option<T>> {
        self.collected.take()
    }
}

impl<T: Send + 'static> StreamingOutput<T> for ListOutput<T> {
    fn set_subscriber(
        &mut self,
        subscriber: Option<Box<dyn Subscriber<T>>>,
    ) -> Result<(), CommandError> {
        match subscriber {
            Some(subscriber) => {
                self.subscriber = subscriber;
                Ok(())
            }
            None => Err(CommandError::InvalidArgument(
                "subscriber must not be null".to_string(),
            )),
        }
    }
}

fn decode_ascii(bytes: Bytes) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<O: CommandOutput>(reply: RespValue, output: O) -> O::Output {
        let mut output = Box::new(output);
        decode_reply(reply, output.as_mut()).unwrap();
        output.finish()
    }

    #[test]
    fn test_status_output() {
        assert_eq!(decode(RespValue::ok(), StatusOutput::new()), "OK");
    }

    #[test]
    fn test_integer_output() {
        assert_eq!(decode(RespValue::integer(42), IntegerOutput::new()), 42);
    }

    #[test]
    fn test_value_output_nil() {
        assert_eq!(decode(RespValue::Null, ValueOutput::new()), None);
        assert_eq!(
            decode(RespValue::bulk_string("v"), ValueOutput::new()),
            Some(Bytes::from("v"))
        );
    }

    #[test]
    fn test_list_output_preserves_nil_positions() {
        let reply = RespValue::array(vec![
            RespValue::bulk_string("a"),
            RespValue::Null,
            RespValue::bulk_string("c"),
        ]);
        assert_eq!(
            decode(reply, StringListOutput::new()),
            vec![Some("a".to_string()), None, Some("c".to_string())]
        );
    }

    #[test]
    fn test_custom_subscriber_receives_stream() {
        let streamed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&streamed);

        let mut output = ValueListOutput::new();
        output
            .set_subscriber(Some(Box::new(move |item: Option<Bytes>| {
                sink.lock().unwrap().push(item);
            })))
            .unwrap();

        let reply = RespValue::array(vec![RespValue::bulk_string("x"), RespValue::Null]);
        let collected = decode(reply, output);

        assert!(collected.is_empty());
        assert_eq!(
            *streamed.lock().unwrap(),
            vec![Some(Bytes::from("x")), None]
        );
    }

    #[test]
    fn test_null_subscriber_is_rejected() {
        let mut output = StringListOutput::new();
        let result = output.set_subscriber(None);
        assert!(matches!(result, Err(CommandError::InvalidArgument(_))));

        // The default subscriber is still in place.
        let reply = RespValue::array(vec![RespValue::bulk_string("k")]);
        assert_eq!(decode(reply, output), vec![Some("k".to_string())]);
    }

    #[test]
    fn test_list_subscriber_shared_target() {
        let target = Arc::new(Mutex::new(Vec::new()));
        let mut subscriber = ListSubscriber::of(Arc::clone(&target));
        subscriber.on_next(Some(1));
        subscriber.on_next(None);
        assert_eq!(*target.lock().unwrap(), vec![Some(1), None]);
        assert_eq!(subscriber.take(), vec![Some(1), None]);
        assert!(target.lock().unwrap().is_empty());
    }

    #[test]
    fn test_resp_output_rebuilds_nested_reply() {
        let reply = RespValue::array(vec![
            RespValue::integer(1),
            RespValue::array(vec![]),
            RespValue::array(vec![RespValue::ok(), RespValue::Null]),
            RespValue::bulk_string("tail"),
        ]);
        assert_eq!(decode(reply.clone(), RespOutput::new()), reply);
        assert_eq!(decode(RespValue::integer(5), RespOutput::new()), RespValue::integer(5));
    }

    #[test]
    fn test_nested_error_aborts_decode() {
        let reply = RespValue::array(vec![
            RespValue::ok(),
            RespValue::error("EXECABORT Transaction discarded"),
        ]);
        let mut output = RespOutput::new();
        assert_eq!(
            decode_reply(reply, &mut output),
            Err("EXECABORT Transaction discarded".to_string())
        );
    }
}
