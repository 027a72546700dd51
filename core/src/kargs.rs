//! Ordered multimap of kernel command-line arguments (§3.1, §4.4).

/// One kernel argument: a key with an optional value (`key` vs `key=value`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    /// The argument's key, e.g. `quiet` or `root`.
    pub key: String,
    /// The argument's value, if any.
    pub value: Option<String>,
}

/// An ordered sequence of kernel command-line arguments.
///
/// `replace` semantics are load-bearing: deployment equality comparisons
/// (the writer's fast-path check) depend on replace-all-matching behaving
/// exactly as specified, not as an incidental convenience (§9).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
}

impl KernelArgs {
    /// An empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space-separated `options` string.
    pub fn parse(s: &str) -> Self {
        let args = s
            .split_ascii_whitespace()
            .map(|tok| match tok.split_once('=') {
                Some((k, v)) => KernelArg {
                    key: k.to_string(),
                    value: Some(v.to_string()),
                },
                None => KernelArg {
                    key: tok.to_string(),
                    value: None,
                },
            })
            .collect();
        Self { args }
    }

    /// Serialize back to a single-spaced `options` string.
    pub fn serialize(&self) -> String {
        self.args
            .iter()
            .map(|a| match &a.value {
                Some(v) => format!("{}={}", a.key, v),
                None => a.key.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Append an argument at the end, preserving insertion order.
    pub fn append(&mut self, key: impl Into<String>, value: Option<String>) {
        self.args.push(KernelArg {
            key: key.into(),
            value,
        });
    }

    /// Prepend an argument at the start.
    pub fn prepend(&mut self, key: impl Into<String>, value: Option<String>) {
        self.args.insert(
            0,
            KernelArg {
                key: key.into(),
                value,
            },
        );
    }

    /// Replace the first occurrence of `key` with `value`, and delete any
    /// subsequent occurrences. If `key` is absent, this is a no-op (callers
    /// that want append-or-replace should check `last_value` first).
    pub fn replace(&mut self, key: &str, value: Option<String>) {
        let mut replaced = false;
        self.args.retain_mut(|a| {
            if a.key != key {
                return true;
            }
            if !replaced {
                a.value = value.clone();
                replaced = true;
                true
            } else {
                false
            }
        });
    }

    /// Delete every occurrence of `key`.
    pub fn delete_all(&mut self, key: &str) {
        self.args.retain(|a| a.key != key);
    }

    /// The last inserted value for `key`, if present. Used to parse the
    /// `ostree=` argument at boot-time discovery (§4.3 step 4).
    pub fn last_value(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .rev()
            .find(|a| a.key == key)
            .and_then(|a| a.value.as_deref())
    }

    /// Iterate over the arguments in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &KernelArg> {
        self.args.iter()
    }
}
