pub mod fields {
    use crate::device::Page;
    use crate::fields::{Field, Kind};
    use crate::output;

    /// Search and output the fields this tool knows how to interpret.
    ///
    /// The device keys are unverified placeholders; compare them with `read --raw` before relying
    /// on them.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only list fields with a name, device key or description containing this text.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the field list")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct FieldSchema {
        pub name: &'static str,
        pub device_key: &'static str,
        pub kind: Kind,
        pub page: Page,
        pub unit: Option<&'static str>,
        pub description: &'static str,
    }

    impl From<Field> for FieldSchema {
        fn from(field: Field) -> Self {
            Self {
                name: field.name(),
                device_key: field.device_key(),
                kind: field.kind(),
                page: field.page(),
                unit: field.unit(),
                description: field.description(),
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(&["Name", "Device key", "Kind", "Page", "Unit", "Description"])
            .map_err(Error::Output)?;
        for &field in Field::all() {
            if let Some(pattern) = &args.filter {
                if !field.is_match(pattern) {
                    continue;
                }
            }
            output
                .record(
                    || {
                        vec![
                            field.name().to_string(),
                            field.device_key().to_string(),
                            field.kind().to_string(),
                            field.page().to_string(),
                            field.unit().unwrap_or_default().to_string(),
                            field.description().to_string(),
                        ]
                    },
                    || FieldSchema::from(field),
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod read {
    use crate::connection;
    use crate::device::{self, Device, MergePolicy, Page};
    use crate::extract::{FieldMap, FieldValue};
    use crate::fields::Field;
    use crate::output;
    use crate::readings::Readings as _;

    /// Read the current state of the heat pump once.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        #[arg(long, value_enum, default_value_t = MergePolicy::Abort)]
        merge_policy: MergePolicy,
        /// Read just this page rather than all of the regularly polled pages.
        #[arg(long, value_enum)]
        page: Option<Page>,
        /// Output every field found on the device, including those this tool does not know.
        #[arg(long)]
        raw: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up a session with the device")]
        Session(#[source] connection::Error),
        #[error("could not read the device")]
        Read(#[source] device::Error),
        #[error("could not output the readings")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct Reading {
        pub name: String,
        pub device_key: Option<&'static str>,
        pub value: FieldValue,
        pub unit: Option<&'static str>,
    }

    impl Reading {
        fn table_row(&self) -> Vec<String> {
            vec![
                self.name.clone(),
                self.device_key.unwrap_or_default().to_string(),
                self.value.to_string(),
                self.unit.unwrap_or_default().to_string(),
            ]
        }
    }

    fn known_readings(fields: &FieldMap) -> Vec<Reading> {
        let mut readings = Vec::new();
        for &field in Field::all() {
            let Some(value) = fields.value(field) else {
                continue;
            };
            readings.push(Reading {
                name: field.name().to_string(),
                device_key: Some(field.device_key()),
                value: value.clone(),
                unit: field.unit(),
            });
        }
        let derived = [
            ("HEATING_CIRCUIT", fields.heating_circuit()),
            ("DOMESTIC_HOT_WATER", fields.domestic_hot_water()),
        ];
        for (circuit, heater) in derived {
            readings.push(Reading {
                name: format!("{circuit}_OPERATION"),
                device_key: None,
                value: FieldValue::Text(heater.operation.to_string()),
                unit: None,
            });
            if let Some(target) = heater.target_temperature {
                readings.push(Reading {
                    name: format!("{circuit}_TARGET_TEMPERATURE"),
                    device_key: None,
                    value: FieldValue::Float(target),
                    unit: Some("°C"),
                });
            }
        }
        if let Some(mode) = fields.regulation_mode() {
            readings.push(Reading {
                name: "REGULATION_MODE_NAME".to_string(),
                device_key: None,
                value: FieldValue::Text(mode.to_string()),
                unit: None,
            });
        }
        readings
    }

    fn raw_readings(fields: FieldMap) -> Vec<Reading> {
        fields
            .into_iter()
            .map(|(key, value)| match Field::from_device_key(&key) {
                Some(field) => Reading {
                    name: field.name().to_string(),
                    device_key: Some(field.device_key()),
                    value,
                    unit: field.unit(),
                },
                None => Reading {
                    name: key,
                    device_key: None,
                    value,
                    unit: None,
                },
            })
            .collect()
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        let session = args.connection.to_session().map_err(Error::Session)?;
        let device = Device::new(session, args.merge_policy);
        let fields = runtime
            .block_on(async {
                match args.page {
                    None => device.fetch_all().await,
                    Some(page) => device.fetch_page(page).await,
                }
            })
            .map_err(Error::Read)?;
        let readings = if args.raw { raw_readings(fields) } else { known_readings(&fields) };

        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(&["Name", "Device key", "Value", "Unit"])
            .map_err(Error::Output)?;
        for reading in readings {
            output.record(|| reading.table_row(), || &reading).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

}

pub mod poll {
    use crate::connection;
    use crate::coordinator::{Coordinator, Snapshot, UpdateError, UpdateEvent};
    use crate::device::{Device, MergePolicy};
    use crate::extract::FieldValue;
    use crate::fields::Field;
    use crate::output::{self, Format, Output};
    use crate::readings::{Readings as _, RegulationMode, WaterHeater};
    use futures::StreamExt as _;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
    use tracing::{info, warn};

    /// Poll the heat pump periodically, printing a JSON line for every successful poll.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[arg(long, value_enum, default_value_t = MergePolicy::Abort)]
        merge_policy: MergePolicy,
        /// How often to poll the device.
        #[arg(long, default_value = "30s")]
        interval: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up a session with the device")]
        Session(#[source] connection::Error),
        #[error("could not listen for the interrupt signal")]
        Signal(#[source] std::io::Error),
        #[error("polling stopped")]
        Authentication(#[source] Arc<UpdateError>),
        #[error("could not output the readings")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct PolledSnapshot<'a> {
        taken_at: jiff::Timestamp,
        fields: BTreeMap<&'static str, &'a FieldValue>,
        regulation_mode: Option<RegulationMode>,
        heating_circuit: WaterHeater,
        domestic_hot_water: WaterHeater,
    }

    impl<'a> PolledSnapshot<'a> {
        fn new(snapshot: &'a Snapshot) -> Self {
            let fields = Field::all()
                .iter()
                .filter_map(|&field| Some((field.name(), snapshot.value(field)?)))
                .collect();
            Self {
                taken_at: snapshot.taken_at,
                fields,
                regulation_mode: snapshot.regulation_mode(),
                heating_circuit: snapshot.heating_circuit(),
                domestic_hot_water: snapshot.domestic_hot_water(),
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        let session = args.connection.to_session().map_err(Error::Session)?;
        let coordinator = Coordinator::new(Device::new(session, args.merge_policy), *args.interval);
        let mut output = Output::new(Format::Jsonl, Box::new(std::io::stdout().lock()), None);
        runtime.block_on(async {
            let mut events = BroadcastStream::new(coordinator.events());
            let _handle = coordinator.spawn();
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                let event = tokio::select! {
                    result = &mut ctrl_c => {
                        result.map_err(Error::Signal)?;
                        info!(message = "interrupted, stopping");
                        break;
                    }
                    event = events.next() => event,
                };
                match event {
                    None => break,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(message = "output could not keep up with polling", skipped);
                    }
                    Some(Ok(UpdateEvent::Updated(snapshot))) => {
                        output
                            .record(Vec::new, || PolledSnapshot::new(&snapshot))
                            .map_err(Error::Output)?;
                    }
                    Some(Ok(UpdateEvent::Failed(error))) => match &*error {
                        UpdateError::AuthenticationRequired(_) => {
                            return Err(Error::Authentication(error));
                        }
                        // Already logged by the coordinator, the next poll may well succeed.
                        UpdateError::UpdateFailed(_) => {}
                    },
                }
            }
            Ok::<_, Error>(())
        })?;
        output.commit().map_err(Error::Output)
    }
}

pub mod set_dhw_temperature {
    use crate::connection;
    use crate::device::{self, Device, MergePolicy};

    /// Change the temperature the domestic hot water is heated to.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// The new target temperature in °C.
        celsius: f64,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up a session with the device")]
        Session(#[source] connection::Error),
        #[error("could not change the domestic hot water temperature")]
        Write(#[source] device::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        let session = args.connection.to_session().map_err(Error::Session)?;
        let device = Device::new(session, MergePolicy::default());
        runtime
            .block_on(device.set_domestic_hot_water_temperature(args.celsius))
            .map_err(Error::Write)
    }
}
