// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod ids;
pub mod messages;
pub mod packet;

pub use ids::{AppId, ConnectionId, InstanceId, SocketId, SocketIdGenerator};
pub use messages::{
  AppInstanceReply, ControlFlags, Discover, DiscoverAppInstances, DiscoverReply, Hello, Message,
  OpenSocket, PayloadError, Publish, PublishReply, SocketControl, SocketData,
};
pub use packet::{PackType, Packet, Transport};
