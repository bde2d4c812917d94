use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::messages::{Request, Response};

/// Upper bound of a single line received from the service.
/// Machine listings of large installations are the biggest messages.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

pub type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;
pub type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

pub fn make_line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

pub fn split_connection(stream: TcpStream) -> (LineReader, LineWriter) {
    let (reader, writer) = stream.into_split();
    (
        FramedRead::new(reader, make_line_codec()),
        FramedWrite::new(writer, make_line_codec()),
    )
}

pub fn encode_request(request: &Request) -> crate::Result<String> {
    Ok(serde_json::to_string(request)?)
}

pub fn decode_response(line: &str) -> crate::Result<Response> {
    Ok(serde_json::from_str(line)?)
}
