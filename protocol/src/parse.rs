//! Command field parsing.

use cache_core::ItemMeta;

use crate::error::ClientError;
use crate::{MAX_ITEM_SIZE, MAX_KEY_SIZE, MAX_RELATIVE_EXPTIME, NOREPLY_OPTION};

fn is_invalid_field_char(b: u8) -> bool {
    b <= b' ' || b == 127
}

/// Validate a key: bounded length, no whitespace or control characters.
pub fn check_key(key: &[u8]) -> Result<(), ClientError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(ClientError::TooLargeKey);
    }
    if key.iter().any(|&b| is_invalid_field_char(b)) {
        return Err(ClientError::InvalidCharInKey);
    }
    Ok(())
}

/// Parse `set` fields: `<key> <flags> <exptime> <bytes> [noreply]`.
///
/// Relative exptimes (positive, up to thirty days) are converted to
/// absolute unix seconds against `now`; zero stays zero and never expires.
pub fn parse_set_fields(fields: &[&[u8]], now: i64) -> Result<(ItemMeta, bool), ClientError> {
    const EXTRA_REQUIRED: usize = 3;
    let (key, extra, noreply) = parse_key_fields(fields, EXTRA_REQUIRED)?;
    check_key(key)?;

    let flags = parse_u64(extra[0])?;
    if flags > u64::from(u32::MAX) {
        return Err(ClientError::FieldsParse);
    }
    let exptime = parse_u64(extra[1])?;
    if exptime > i64::MAX as u64 {
        return Err(ClientError::FieldsParse);
    }
    let mut exptime = exptime as i64;
    if exptime != 0 && exptime <= MAX_RELATIVE_EXPTIME {
        exptime += now;
    }
    let bytes = parse_u64(extra[2])? as usize;
    if bytes > MAX_ITEM_SIZE {
        return Err(ClientError::TooLargeItem);
    }

    Ok((
        ItemMeta {
            key: key.to_vec(),
            flags: flags as u32,
            exptime,
            bytes,
        },
        noreply,
    ))
}

/// Parse `get`/`gets` fields: one key or more, all valid.
pub fn parse_get_fields(fields: &[&[u8]]) -> Result<(), ClientError> {
    if fields.is_empty() {
        return Err(ClientError::MoreFieldsRequired);
    }
    for key in fields {
        check_key(key)?;
    }
    Ok(())
}

/// Parse `delete` fields: `<key> [noreply]`.
pub fn parse_delete_fields<'a>(fields: &[&'a [u8]]) -> Result<(&'a [u8], bool), ClientError> {
    let (key, _, noreply) = parse_key_fields(fields, 0)?;
    check_key(key)?;
    Ok((key, noreply))
}

/// Split fields into key, exactly `extra_required` positional values, and
/// the only accepted trailing option.
fn parse_key_fields<'a, 'b>(
    fields: &'b [&'a [u8]],
    extra_required: usize,
) -> Result<(&'a [u8], &'b [&'a [u8]], bool), ClientError> {
    if fields.len() < 1 + extra_required {
        return Err(ClientError::MoreFieldsRequired);
    }
    let key = fields[0];
    let extra = &fields[1..1 + extra_required];
    let options = &fields[1 + extra_required..];
    const MAX_OPTIONS: usize = 1;
    if options.len() > MAX_OPTIONS {
        return Err(ClientError::TooManyFields);
    }
    let noreply = match options {
        [] => false,
        [option] if *option == NOREPLY_OPTION => true,
        _ => return Err(ClientError::InvalidOption),
    };
    Ok((key, extra, noreply))
}

fn parse_u64(field: &[u8]) -> Result<u64, ClientError> {
    let s = std::str::from_utf8(field).map_err(|_| ClientError::FieldsParse)?;
    s.parse().map_err(|_| ClientError::FieldsParse)
}
