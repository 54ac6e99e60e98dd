/// Whether a stream item error only concerns a single malformed frame, so
/// the rest of the stream is still worth reading.
pub fn is_recoverable_error(e: &bollard::errors::Error) -> bool {
    matches!(
        &e,
        bollard::errors::Error::JsonDataError { .. }
            | bollard::errors::Error::JsonSerdeError { .. }
            | bollard::errors::Error::StrParseError { .. }
            | bollard::errors::Error::StrFmtError { .. }
            | bollard::errors::Error::URLEncodedError { .. }
    )
}
