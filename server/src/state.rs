use std::sync::Arc;

use crate::config::Config;
use crate::gateways::{PaymentGateway, SmsSender};
use crate::services::{BookingService, Notifier, PaymentSweeper, Reconciler};
use crate::store::Store;

/// Shared handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub sms: Arc<dyn SmsSender>,
    pub booking: Arc<BookingService>,
    pub reconciler: Arc<Reconciler>,
    pub notifier: Arc<Notifier>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        sms: Arc<dyn SmsSender>,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(sms.clone(), config.public_base_url.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            gateway.clone(),
            notifier.clone(),
        ));
        let booking = Arc::new(BookingService::new(
            store.clone(),
            gateway.clone(),
            config.booking.clone(),
        ));

        Self {
            config: Arc::new(config),
            store,
            gateway,
            sms,
            booking,
            reconciler,
            notifier,
        }
    }

    pub fn sweeper(&self) -> PaymentSweeper {
        PaymentSweeper::new(
            self.store.clone(),
            self.gateway.clone(),
            self.reconciler.clone(),
            self.config.booking.clone(),
        )
    }
}
