//! Verbway is a runtime-resolved wrapper over [rdma-core]
//!
//! Nothing is linked at build time: the verbs and connection manager entry points are resolved
//! from the shared libraries on first use (see [`ibverbs::symbols`]), or from the in-process
//! `ibverbs::loopback` provider when there is no RDMA hardware around. The provider is compiled
//! with the `loopback` feature.
//!
//! [rdma-core]: https://github.com/linux-rdma/rdma-core

/// The wrapper over [libibverbs](https://github.com/linux-rdma/rdma-core/tree/master/libibverbs),
/// which provides the basic operations for resources creation and data send / receive.
pub mod ibverbs;

/// The wrapper over [librdmacm](https://github.com/linux-rdma/rdma-core/tree/master/librdmacm),
/// which is the in-band (compared to TCP, which is out-of-band) connection manager for RDMA.
pub mod rdmacm;
