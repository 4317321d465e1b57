pub mod bus;
pub mod nats;

pub use self::bus::{EventSubscription, InMemoryEventBus};
pub use self::nats::{NatsEventPublisher, NatsEventSubscriber, NatsPublisherConfig};
