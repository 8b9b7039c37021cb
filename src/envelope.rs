/// One unit of work in flight between the broker and the pipeline.
///
/// `Envelope` pairs message metadata with its payload and stays agnostic of
/// both the broker and the HTTP representation.
///
/// ## Design
///
/// - `H` is the metadata: correlation id, reply destination and messaging
///   properties for inbound requests ([`RequestMeta`](crate::codec::RequestMeta)),
///   or publish targeting for outbound messages
///   ([`PublishMeta`](crate::transport::PublishMeta))
/// - `M` is the payload: an `http::Request`/`http::Response`, or raw bytes
///   once encoded
///
/// Keeping the two apart lets the codec rewrite the payload while the
/// correlation data travels through untouched.
///
/// ## Example
///
/// ```rust
/// use courier::Envelope;
///
/// let envelope = Envelope {
///     headers: "corr-1",
///     message: 42,
/// };
///
/// // or, equivalently
/// let same: Envelope<_, _> = ("corr-1", 42).into();
/// assert_eq!(envelope, same);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> Envelope<H, M> {
    /// Replace the payload, keeping the metadata.
    pub fn map_message<N>(self, f: impl FnOnce(M) -> N) -> Envelope<H, N> {
        Envelope {
            headers: self.headers,
            message: f(self.message),
        }
    }

    pub fn into_parts(self) -> (H, M) {
        (self.headers, self.message)
    }
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}
