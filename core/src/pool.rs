//! The seam between the data source and the connection pool it wraps.
//!
//! Connection checkout, return, validation and eviction stay entirely inside
//! the pool implementation. The data source only ever points the pool at a
//! connection string and closes it.

use crate::errors::BoxError;

/// A database connection pool that can be re-pointed at a connection string.
pub trait ConnectionPool: Send {
    /// Replace the connection string new physical connections are opened with.
    fn set_url(&mut self, url: &str) -> Result<(), BoxError>;

    /// Release every pooled connection and refuse further checkouts.
    fn close(&mut self) -> Result<(), BoxError>;
}

impl<P: ConnectionPool + ?Sized> ConnectionPool for Box<P> {
    fn set_url(&mut self, url: &str) -> Result<(), BoxError> {
        (**self).set_url(url)
    }

    fn close(&mut self) -> Result<(), BoxError> {
        (**self).close()
    }
}
