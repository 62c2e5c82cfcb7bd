// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::error::Error;
use std::fmt;

/// Formats an error and all of its sources on one line, separated by `: `.
///
/// Also usable directly in a slog key-value list, where it logs under the
/// `error` key.
pub struct InlineErrorChain<'a>(&'a dyn Error);

impl<'a> InlineErrorChain<'a> {
    pub fn new(err: &'a dyn Error) -> Self {
        Self(err)
    }
}

impl fmt::Display for InlineErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}

impl slog::KV for InlineErrorChain<'_> {
    fn serialize(
        &self,
        _record: &slog::Record<'_>,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments("error".into(), &format_args!("{self}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn joins_sources() {
        let err = Outer(Inner);
        assert_eq!(InlineErrorChain::new(&err).to_string(), "outer: inner");
    }

    #[derive(Default)]
    struct Fields(Vec<(String, String)>);

    impl slog::Serializer for Fields {
        fn emit_arguments(
            &mut self,
            key: slog::Key,
            val: &std::fmt::Arguments<'_>,
        ) -> slog::Result {
            self.0.push((key.to_string(), val.to_string()));
            Ok(())
        }
    }

    struct Capture(Arc<Mutex<Fields>>);

    impl slog::Drain for Capture {
        type Ok = ();
        type Err = slog::Never;

        fn log(
            &self,
            record: &slog::Record<'_>,
            _values: &slog::OwnedKVList,
        ) -> Result<(), slog::Never> {
            let mut fields = self.0.lock().unwrap();
            let _ = slog::KV::serialize(&record.kv(), record, &mut *fields);
            Ok(())
        }
    }

    #[test]
    fn logs_chain_under_error_key() {
        let fields = Arc::new(Mutex::new(Fields::default()));
        let log = slog::Logger::root(Capture(Arc::clone(&fields)), slog::o!());
        let err = Outer(Inner);
        slog::warn!(log, "step failed"; InlineErrorChain::new(&err));

        let fields = fields.lock().unwrap();
        assert_eq!(
            fields.0,
            vec![("error".to_string(), "outer: inner".to_string())]
        );
    }
}
