// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFC 6120 XML streams: framing and the stream-level parser.
//!
//! The wire carries one synthetic XML document per direction whose root is
//! `<stream:stream>`; everything interesting is a direct child of that
//! root. [`XmppCodec`] turns the byte stream into [`Packet`]s: the stream
//! header, fully-materialized top-level elements, inter-stanza whitespace
//! (keepalives) and the closing tag. [`XmlStream`] couples the decoder
//! with a raw write half and provides the request/reply reading mode used
//! during stream negotiation.
//!
//! A parser instance is only valid for a single stream: stream restarts
//! (after STARTTLS, after SASL, on resumption) create a fresh codec over
//! the same transport.

use std::io;

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use quick_xml::errors::Error as XmlError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, FramedRead};

use crate::connect::AsyncReadAndWrite;
use crate::element::Element;
use crate::error::{Error, ProtocolError};
use crate::ns;

/// The transport all streams run over once connected.
pub type BoxStream = Box<dyn AsyncReadAndWrite>;

/// The read side after negotiation hand-off.
pub type StreamReader = FramedRead<ReadHalf<BoxStream>, XmppCodec>;

/// The write side after negotiation hand-off.
pub type StreamWriter = WriteHalf<BoxStream>;

/// Attributes of the peer's `<stream:stream>` header.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The `from` attribute.
    pub from: Option<String>,
    /// The stream id.
    pub id: Option<String>,
    /// The `xml:lang` attribute.
    pub lang: Option<String>,
}

/// A frame read from the stream.
#[derive(Debug, Clone)]
pub enum Packet {
    /// The peer's `<stream:stream>` header.
    StreamStart(StreamHeader),
    /// A top-level child element with all descendants materialized.
    Stanza(Element),
    /// Inter-stanza text; whitespace keepalives end up here.
    Text(String),
    /// The peer's `</stream:stream>`.
    StreamEnd,
}

/// Stateless decoder producing [`Packet`]s from the inbound byte stream.
///
/// The decoder scans for one complete top-level unit with quick-xml, then
/// materializes it; at most one pending element is ever buffered.
#[derive(Debug, Default)]
pub struct XmppCodec;

impl XmppCodec {
    /// Constructor
    pub fn new() -> Self {
        XmppCodec
    }
}

const WHITESPACE: &[u8] = b" \t\r\n";

impl Decoder for XmppCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Error> {
        let ws = src
            .iter()
            .take_while(|b| WHITESPACE.contains(b))
            .count();
        if ws == src.len() {
            if ws == 0 {
                return Ok(None);
            }
            let text = String::from_utf8_lossy(&src.split_to(ws)).into_owned();
            return Ok(Some(Packet::Text(text)));
        }
        if ws > 0 {
            src.advance(ws);
        }

        // The closing tag arrives without its opening tag in the buffer
        // (the header was consumed long ago), so match it directly.
        const STREAM_END: &[u8] = b"</stream:stream>";
        if src.starts_with(STREAM_END) {
            src.advance(STREAM_END.len());
            return Ok(Some(Packet::StreamEnd));
        }

        let mut reader = Reader::from_reader(&src[..]);
        reader.config_mut().check_end_names = false;

        let mut depth = 0usize;
        let mut stanza_start = 0usize;

        loop {
            let pos = reader.buffer_position() as usize;
            let event = match reader.read_event() {
                Ok(event) => event,
                // Truncated unit: the next TCP read will complete it.
                Err(XmlError::Syntax(_)) => return Ok(None),
                Err(e) => return Err(ProtocolError::Parser(e.to_string()).into()),
            };
            match event {
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => (),
                Event::Start(start) => {
                    if depth == 0 && start.name().as_ref() == b"stream:stream" {
                        let mut header = StreamHeader::default();
                        for attr in start.attributes() {
                            let attr =
                                attr.map_err(|e| ProtocolError::Parser(e.to_string()))?;
                            let value = attr
                                .unescape_value()
                                .map_err(|e| ProtocolError::Parser(e.to_string()))?
                                .into_owned();
                            match attr.key.as_ref() {
                                b"from" => header.from = Some(value),
                                b"id" => header.id = Some(value),
                                b"xml:lang" => header.lang = Some(value),
                                _ => (),
                            }
                        }
                        let end = reader.buffer_position() as usize;
                        src.advance(end);
                        return Ok(Some(Packet::StreamStart(header)));
                    }
                    if depth == 0 {
                        stanza_start = pos;
                    }
                    depth += 1;
                }
                Event::Empty(_) => {
                    if depth == 0 {
                        let end = reader.buffer_position() as usize;
                        let el = Element::parse_slice(&src[pos..end])?;
                        src.advance(end);
                        return Ok(Some(Packet::Stanza(el)));
                    }
                }
                Event::Text(_) | Event::CData(_) => (),
                Event::End(_) => {
                    let end = reader.buffer_position() as usize;
                    if depth == 0 {
                        // Closing tag of the stream root itself.
                        src.advance(end);
                        return Ok(Some(Packet::StreamEnd));
                    }
                    depth -= 1;
                    if depth == 0 {
                        let el = Element::parse_slice(&src[stanza_start..end])?;
                        src.advance(end);
                        return Ok(Some(Packet::Stanza(el)));
                    }
                }
                Event::Eof => return Ok(None),
            }
        }
    }
}

/// An open XML stream: framed reads plus raw serialized writes.
///
/// During negotiation this is the temporarily exclusive parser consumer;
/// afterwards [`XmlStream::into_parts`] hands the halves to the dispatcher
/// and the shared writer.
pub struct XmlStream {
    reader: StreamReader,
    writer: StreamWriter,
    header: StreamHeader,
}

impl XmlStream {
    /// Send our `<stream:stream>` header over `stream` and read the peer's.
    pub async fn open(stream: BoxStream, to: &str, lang: &str) -> Result<XmlStream, Error> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut stream = XmlStream {
            reader: FramedRead::new(read_half, XmppCodec::new()),
            writer: write_half,
            header: StreamHeader::default(),
        };
        let open = format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='{}' xmlns:stream='{}' xml:lang='{}'>",
            to,
            ns::JABBER_CLIENT,
            ns::STREAM,
            lang,
        );
        stream.send_raw(&open).await?;

        loop {
            match stream.reader.next().await {
                Some(Ok(Packet::StreamStart(header))) => {
                    stream.header = header;
                    return Ok(stream);
                }
                Some(Ok(Packet::Text(_))) => (),
                Some(Ok(Packet::StreamEnd)) => {
                    return Err(ProtocolError::StreamClosed.into())
                }
                Some(Ok(Packet::Stanza(el))) => {
                    return Err(ProtocolError::UnexpectedElement(el.name().to_owned()).into())
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::Disconnected),
            }
        }
    }

    /// Open a fresh stream over the same transport, discarding all parser
    /// state.
    pub async fn restart(self, to: &str, lang: &str) -> Result<XmlStream, Error> {
        let stream = self.reader.into_inner().unsplit(self.writer);
        XmlStream::open(stream, to, lang).await
    }

    /// Discard all XML state and return the transport.
    pub fn into_inner(self) -> BoxStream {
        self.reader.into_inner().unsplit(self.writer)
    }

    /// Split into the dispatcher's read side and the shared write side.
    pub fn into_parts(self) -> (StreamReader, StreamWriter, StreamHeader) {
        (self.reader, self.writer, self.header)
    }

    /// The `xml:lang` advertised by the peer's header, defaulting to `en`.
    pub fn lang(&self) -> &str {
        self.header.lang.as_deref().unwrap_or("en")
    }

    /// The stream id from the peer's header.
    pub fn id(&self) -> Option<&str> {
        self.header.id.as_deref()
    }

    /// Write raw bytes to the transport.
    pub async fn send_raw(&mut self, xml: &str) -> Result<(), Error> {
        self.writer.write_all(xml.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Serialize and send a single element.
    pub async fn send_element(&mut self, el: &Element) -> Result<(), Error> {
        self.send_raw(&el.to_xml()).await
    }

    /// Block until the next child element is fully available.
    ///
    /// If `expected` is given, an element whose local name is not in the
    /// set fails with [`ProtocolError::UnexpectedElement`]. The stream
    /// root's closing tag surfaces as [`ProtocolError::StreamClosed`].
    pub async fn next_element(&mut self, expected: Option<&[&str]>) -> Result<Element, Error> {
        loop {
            match self.reader.next().await {
                Some(Ok(Packet::Stanza(el))) => {
                    if let Some(expected) = expected {
                        if !expected.contains(&el.name()) {
                            return Err(
                                ProtocolError::UnexpectedElement(el.name().to_owned()).into()
                            );
                        }
                    }
                    return Ok(el);
                }
                Some(Ok(Packet::Text(_))) => (),
                Some(Ok(Packet::StreamStart(_))) => {
                    return Err(ProtocolError::UnexpectedElement("stream:stream".to_owned()).into())
                }
                Some(Ok(Packet::StreamEnd)) => return Err(ProtocolError::StreamClosed.into()),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream footer",
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut XmppCodec, buf: &mut BytesMut) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(packet) = codec.decode(buf).unwrap() {
            out.push(packet);
        }
        out
    }

    #[test]
    fn decodes_stream_header() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(
            &b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.org' id='abc' xml:lang='de' version='1.0'>"[..],
        );
        match codec.decode(&mut buf).unwrap() {
            Some(Packet::StreamStart(header)) => {
                assert_eq!(header.from.as_deref(), Some("example.org"));
                assert_eq!(header.id.as_deref(), Some("abc"));
                assert_eq!(header.lang.as_deref(), Some("de"));
            }
            other => panic!("decoded {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_consecutive_stanzas() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(
            &b"<r xmlns='urn:xmpp:sm:3'/><message to='a@b'><body>Hi</body></message><a xmlns='urn:xmpp:sm:3' h='1'/>"[..],
        );
        let packets = decode_all(&mut codec, &mut buf);
        assert_eq!(packets.len(), 3);
        match (&packets[0], &packets[1], &packets[2]) {
            (Packet::Stanza(r), Packet::Stanza(msg), Packet::Stanza(a)) => {
                assert!(r.is("r", ns::SM));
                assert_eq!(msg.get_child_named("body").unwrap().text(), "Hi");
                assert_eq!(a.attr("h"), Some("1"));
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn buffers_partial_stanza() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(&b"<iq type='get'><query xmlns='jabber:iq:ros"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ter'/></iq>");
        match codec.decode(&mut buf).unwrap() {
            Some(Packet::Stanza(el)) => assert_eq!(el.name(), "iq"),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn whitespace_keepalive_between_stanzas() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(&b"\n "[..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Packet::Text(t)) => assert_eq!(t, "\n "),
            other => panic!("decoded {:?}", other),
        }
        buf.extend_from_slice(b"  <presence/>");
        match codec.decode(&mut buf).unwrap() {
            Some(Packet::Stanza(el)) => assert_eq!(el.name(), "presence"),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn stream_end_after_header_consumed() {
        let mut codec = XmppCodec::new();
        let mut buf = BytesMut::from(
            &b"<stream:stream xmlns='jabber:client' version='1.0'><presence/></stream:stream>"[..],
        );
        let packets = decode_all(&mut codec, &mut buf);
        assert!(matches!(packets[0], Packet::StreamStart(_)));
        assert!(matches!(packets[1], Packet::Stanza(_)));
        assert!(matches!(packets[2], Packet::StreamEnd));
    }

    #[tokio::test]
    async fn negotiation_reader_contract() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("<stream:stream"));
            server
                .write_all(
                    b"<stream:stream xmlns='jabber:client' id='s1' xml:lang='fr' version='1.0'>\
                      <stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>\
                      <message from='a@b'><body>x</body></message>",
                )
                .await
                .unwrap();
            server
        });

        let boxed: BoxStream = Box::new(client);
        let mut stream = XmlStream::open(boxed, "example.org", "en").await.unwrap();
        assert_eq!(stream.lang(), "fr");
        assert_eq!(stream.id(), Some("s1"));

        let features = stream.next_element(Some(&["features"])).await.unwrap();
        assert!(features.has_child("bind", ns::BIND));

        match stream.next_element(Some(&["proceed"])).await {
            Err(Error::Protocol(ProtocolError::UnexpectedElement(name))) => {
                assert_eq!(name, "message")
            }
            other => panic!("got {:?}", other.map(|el| el.to_xml())),
        }
        let _ = server_task.await.unwrap();
    }
}
