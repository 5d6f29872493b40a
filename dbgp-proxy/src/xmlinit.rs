// Copyright (C) 2024  dbgp-proxy contributors
//
// This file is part of dbgp-proxy.
//
// dbgp-proxy is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Reads and rewrites the DBGp init packet. Only the root `<init>`
//! element's attributes are mutated; everything else in the document
//! (children, text, comments) is replayed unchanged. A minimal DOM isn't
//! needed since the document is small and bounded and the rest of it is
//! opaque to the proxy.

use std::io::Cursor;

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::Error;

fn root_start<'a>(e: &'a BytesStart<'a>) -> Result<&'a BytesStart<'a>, Error> {
    if e.name().local_name().as_ref() != b"init" {
        Err(Error::Framing("root element is not <init>".into()))
    } else {
        Ok(e)
    }
}

/// Extract the `idekey` attribute from an init packet without mutating it.
pub fn extract_idekey(body: &str) -> Result<String, Error> {
    let mut reader = Reader::from_str(body);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => {
                return Err(Error::Framing("<init> element not found".into()));
            }
            Event::Start(ref e) | Event::Empty(ref e) => {
                root_start(e)?;
                for attr in e.attributes() {
                    let attr =
                        attr.map_err(|e| Error::Framing(format!("bad attribute: {e}")))?;
                    if attr.key.as_ref() == b"idekey" {
                        return Ok(attr.unescape_value()?.into_owned());
                    }
                }
                return Err(Error::Framing("<init> missing idekey attribute".into()));
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Set `proxied` to `proxied_addr` and, if `hostname` is absent or empty,
/// set it to `default_hostname`. Returns the reserialized document with an
/// XML declaration prepended.
pub fn mutate_init_packet(
    body: &str,
    proxied_addr: &str,
    default_hostname: &str,
) -> Result<String, Error> {
    let mut reader = Reader::from_str(body);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut root_seen = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if !root_seen => {
                root_seen = true;
                root_start(e)?;
                writer.write_event(Event::Start(mutate_attrs(e, proxied_addr, default_hostname)?))?;
            }
            Event::Empty(ref e) if !root_seen => {
                root_seen = true;
                root_start(e)?;
                writer.write_event(Event::Empty(mutate_attrs(e, proxied_addr, default_hostname)?))?;
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    if !root_seen {
        return Err(Error::Framing("<init> element not found".into()));
    }

    let bytes = writer.into_inner().into_inner();
    let serialized = String::from_utf8(bytes)
        .map_err(|_| Error::Framing("mutated document is not utf-8".into()))?;
    Ok(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{serialized}"
    ))
}

fn mutate_attrs(
    e: &BytesStart,
    proxied_addr: &str,
    default_hostname: &str,
) -> Result<BytesStart<'static>, Error> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Framing(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "proxied" {
            continue;
        }
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }

    match attrs.iter_mut().find(|(k, _)| k == "hostname") {
        Some((_, v)) if !v.is_empty() => {}
        Some((_, v)) => *v = default_hostname.to_string(),
        None => attrs.push(("hostname".to_string(), default_hostname.to_string())),
    }

    attrs.push(("proxied".to_string(), proxied_addr.to_string()));

    let mut new_elem = BytesStart::new("init");
    for (key, value) in &attrs {
        let escaped = quick_xml::escape::escape(value.as_str());
        new_elem.push_attribute((key.as_str(), escaped.as_ref()));
    }
    Ok(new_elem.into_owned())
}
