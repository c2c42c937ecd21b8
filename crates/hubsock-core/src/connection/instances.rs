// ── Instance messaging ──
//
// `sendTo` requests and client subscriptions to messages an adapter
// instance pushes (`im` events).

use std::sync::Arc;

use futures_util::future::try_join_all;
use serde_json::{Value, json};
use tracing::debug;

use super::Connection;
use crate::callback::InstanceMessageHandler;
use crate::error::ConnectionError;
use crate::model::admin::instance_object_id;
use crate::model::object::is_truthy;

impl Connection {
    /// Send `command` with `data` to an adapter instance and return its
    /// answer (`Null` if it did not answer with data).
    pub async fn send_to(
        &self,
        instance: &str,
        command: &str,
        data: Value,
    ) -> Result<Value, ConnectionError> {
        let reply = self
            .call("sendTo", vec![json!(instance), json!(command), data])
            .await?;
        Ok(reply.into_iter().next().unwrap_or(Value::Null))
    }

    /// Ask `target` to push messages of `message_type` to this client and
    /// route them to `handler`. An `error` field in the answer is a
    /// rejection.
    pub async fn subscribe_on_instance(
        &self,
        target: &str,
        message_type: &str,
        data: Value,
        handler: Arc<InstanceMessageHandler>,
    ) -> Result<Value, ConnectionError> {
        let result = self
            .call_value(
                "clientSubscribe",
                vec![json!(target), json!(message_type), data],
            )
            .await?;
        if let Some(err) = result.get("error").filter(|err| is_truthy(err)) {
            return Err(ConnectionError::from_server(err));
        }

        let instance = instance_object_id(target);
        debug!(instance, message_type, "subscribed on instance");
        self.tables()
            .instances
            .subscribe(&instance, message_type, handler);
        Ok(result)
    }

    /// Drop instance subscriptions matching the filters. Without a handler
    /// or without a message type every matching registration is removed.
    /// Returns whether the server reported any of the removed types as
    /// subscribed.
    pub async fn unsubscribe_from_instance(
        &self,
        target: &str,
        message_type: Option<&str>,
        handler: Option<&Arc<InstanceMessageHandler>>,
    ) -> Result<bool, ConnectionError> {
        let instance = instance_object_id(target);
        let released = {
            let mut t = self.tables();
            let mut released = Vec::new();
            while let Some((removed_type, type_remains)) =
                t.instances.remove_one(&instance, message_type, handler)
            {
                if !type_remains {
                    released.push(removed_type);
                }
                if handler.is_some() && message_type.is_some() {
                    break;
                }
            }
            released
        };

        if released.is_empty() || !self.is_connected() {
            return Ok(false);
        }

        let requests = released.iter().map(|removed_type| {
            self.call_value(
                "clientUnsubscribe",
                vec![json!(instance), json!(removed_type)],
            )
        });
        let results = try_join_all(requests).await?;
        Ok(results.iter().any(is_truthy))
    }
}

