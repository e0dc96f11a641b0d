//! Registry of the customers living in this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::customer::Customer;
use crate::error::PostofficeError;

/// Customers by id, with a wait for late registrations.
///
/// A message can arrive before its application finished registering; the
/// receive loop then waits on [`CustomerRegistry::get`] for a bounded time.
#[derive(Debug, Default)]
pub(crate) struct CustomerRegistry {
    customers: Mutex<HashMap<i32, Arc<Customer>>>,
    registered: Notify,
}

impl CustomerRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Arc<Customer>>> {
        self.customers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn add(&self, customer: Arc<Customer>) -> Result<(), PostofficeError> {
        let id = customer.id();
        {
            let mut customers = self.lock();
            if customers.contains_key(&id) {
                return Err(PostofficeError::DuplicateCustomer(id));
            }
            customers.insert(id, customer);
        }
        self.registered.notify_waiters();
        Ok(())
    }

    pub(crate) fn remove(&self, id: i32) -> Option<Arc<Customer>> {
        self.lock().remove(&id)
    }

    pub(crate) fn try_get(&self, id: i32) -> Option<Arc<Customer>> {
        self.lock().get(&id).cloned()
    }

    /// Wait up to `timeout` for customer `id` to be registered.
    pub(crate) async fn get(&self, id: i32, timeout: Duration) -> Option<Arc<Customer>> {
        let wait = async {
            loop {
                let notified = self.registered.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(customer) = self.try_get(id) {
                    return customer;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }
}
