// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod connection;
pub mod dispatch;
pub mod protocol;
pub mod tls;
