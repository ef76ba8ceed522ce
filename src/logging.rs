// SPDX-License-Identifier: GPL-3.0-or-later
// This file is part of rv-lisp.
// Copyright (C) 2025  Andrei Kochergin <zeek@tuta.com>

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the global tracing subscriber once. An explicit level
/// overrides `RUST_LOG`; later calls are no-ops.
pub fn init_with_level(level: Option<&str>) {
    INIT.call_once(|| {
        let directive = level
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "info".to_owned());

        let filter = tracing_subscriber::EnvFilter::try_new(&directive).unwrap_or_else(|e| {
            eprintln!("WARN: invalid log filter '{directive}': {e}; using 'info'");
            tracing_subscriber::EnvFilter::new("info")
        });

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init();
    });
}
