use crate::connection::{self, ErrorClass, Form, Session};
use crate::extract::{self, FieldMap};
use crate::fields::Field;
use reqwest::Method;
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

/// Temperatures the device accepts for the domestic hot water setpoint, in °C.
pub const DHW_TEMPERATURE_RANGE: RangeInclusive<f64> = 10.0..=56.0;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    strum::Display,
    strum::VariantArray,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Page {
    Measurements,
    Controls,
    /// Never polled: the device serves this page with a broken encoding.
    Settings,
    Equitherm,
}

impl Page {
    pub const fn path(self) -> &'static str {
        match self {
            Page::Measurements => "PAGE214.XML",
            Page::Controls => "PAGE215.XML",
            Page::Settings => "PAGE216.XML",
            Page::Equitherm => "PAGE217.XML",
        }
    }
}

/// Pages read by [`Device::fetch_all`], in the order their fields are merged.
pub const POLLED_PAGES: [Page; 3] = [Page::Measurements, Page::Controls, Page::Equitherm];

/// What to do when one of the [`POLLED_PAGES`] cannot be read.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Fail the whole read.
    #[default]
    Abort,
    /// Leave the fields of the failed page out and carry on with the other pages.
    ///
    /// Authentication failures still fail the read, as do failures of all pages.
    SkipFailed,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not fetch the {1} page")]
    Fetch(#[source] connection::Error, Page),
    #[error("domestic hot water temperature of {0}°C is outside of the supported range")]
    SetpointOutOfRange(f64),
    #[error("could not write the domestic hot water temperature")]
    WriteSetpoint(#[source] connection::Error),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Fetch(e, _) | Error::WriteSetpoint(e) => e.class(),
            Error::SetpointOutOfRange(_) => ErrorClass::General,
        }
    }
}

/// The heat pump, as seen through its web interface.
pub struct Device {
    session: Session,
    policy: MergePolicy,
}

impl Device {
    pub fn new(session: Session, policy: MergePolicy) -> Self {
        Self { session, policy }
    }

    pub async fn fetch_page(&self, page: Page) -> Result<FieldMap, Error> {
        let response = self
            .session
            .fetch(Method::GET, page.path(), None)
            .await
            .map_err(|e| Error::Fetch(e, page))?;
        let markup = connection::read_text(response).await.map_err(|e| Error::Fetch(e, page))?;
        let fields = extract::extract(&markup);
        debug!(message = "read page", %page, fields = fields.len());
        Ok(fields)
    }

    /// Read all of the [`POLLED_PAGES`] one after another and merge their fields.
    pub async fn fetch_all(&self) -> Result<FieldMap, Error> {
        let mut pages = Vec::with_capacity(POLLED_PAGES.len());
        let mut last_error = None;
        for page in POLLED_PAGES {
            match self.fetch_page(page).await {
                Ok(fields) => pages.push(fields),
                Err(e)
                    if self.policy == MergePolicy::SkipFailed
                        && e.class() != ErrorClass::Authentication =>
                {
                    warn!(
                        message = "could not read a page, leaving its fields out",
                        %page,
                        error = (&e as &dyn std::error::Error)
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        match last_error {
            Some(e) if pages.is_empty() => Err(e),
            _ => Ok(merge_pages(pages)),
        }
    }

    /// Change the temperature the domestic hot water is heated to.
    pub async fn set_domestic_hot_water_temperature(&self, celsius: f64) -> Result<(), Error> {
        if !DHW_TEMPERATURE_RANGE.contains(&celsius) {
            return Err(Error::SetpointOutOfRange(celsius));
        }
        let field = Field::DhwTemperatureRequired;
        let form = setpoint_form(field, celsius);
        self.session
            .fetch(Method::POST, field.page().path(), Some(&form))
            .await
            .map_err(Error::WriteSetpoint)?;
        info!(message = "domestic hot water temperature set", celsius);
        Ok(())
    }
}

/// Merge per-page fields; fields of later pages replace those of earlier ones.
pub fn merge_pages(pages: impl IntoIterator<Item = FieldMap>) -> FieldMap {
    let mut merged = FieldMap::new();
    for page in pages {
        merged.extend(page);
    }
    merged
}

/// The device expects the assignment as the name of a form field with an empty value.
fn setpoint_form(field: Field, value: f64) -> Form {
    vec![(format!("{}={value:.1}", field.device_key()), String::new())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{SESSION_COOKIE, login_mock, login_redirect_mock, session_for};
    use crate::extract::FieldValue;
    use mockito::{Matcher, Server};
    use std::time::Duration;

    fn markup(inputs: &[(&str, &str)]) -> String {
        let mut markup = String::from("<?xml version=\"1.0\"?>\n<PAGE>\n");
        for (name, value) in inputs {
            markup.push_str(&format!("<INPUT NAME=\"{name}\" VALUE=\"{value}\"/>\n"));
        }
        markup.push_str("</PAGE>\n");
        markup
    }

    fn text(v: &str) -> FieldValue {
        FieldValue::Text(v.to_string())
    }

    async fn serve(server: &mut Server, page: Page, body: String) -> mockito::Mock {
        server
            .mock("GET", format!("/{}", page.path()).as_str())
            .with_status(200)
            .with_header("content-type", "text/xml")
            .with_body(body)
            .create_async()
            .await
    }

    #[test]
    fn later_pages_win() {
        let first = FieldMap::from([("A".to_string(), text("1"))]);
        let second = FieldMap::from([("A".to_string(), text("2")), ("B".to_string(), text("3"))]);
        let merged = merge_pages([first, second]);
        assert_eq!(
            merged,
            FieldMap::from([("A".to_string(), text("2")), ("B".to_string(), text("3"))])
        );
    }

    #[test]
    fn setpoint_is_sent_as_the_field_name() {
        let form = setpoint_form(Field::DhwTemperatureRequired, 21.5);
        assert_eq!(form, vec![("__TF05C29B3_REAL_.1f=21.5".to_string(), String::new())]);
        let form = setpoint_form(Field::DhwTemperatureRequired, 48.0);
        assert_eq!(form[0].0, "__TF05C29B3_REAL_.1f=48.0");
    }

    #[tokio::test]
    async fn fetches_and_merges_polled_pages() {
        let mut server = Server::new_async().await;
        let measurements = serve(
            &mut server,
            Page::Measurements,
            markup(&[("A", "1"), ("__T4D6A0F18_BOOL_i", "1")]),
        )
        .await;
        let controls = serve(&mut server, Page::Controls, markup(&[("A", "2"), ("B", "3")])).await;
        let equitherm =
            serve(&mut server, Page::Equitherm, markup(&[("__T6C0F3A95_REAL_.1f", "31.5")])).await;
        let settings = server
            .mock("GET", "/PAGE216.XML")
            .expect(0)
            .create_async()
            .await;

        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        let fields = device.fetch_all().await.unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields["A"], text("2"));
        assert_eq!(fields["B"], text("3"));
        assert_eq!(fields["__T4D6A0F18_BOOL_i"], FieldValue::Bool(true));
        assert_eq!(fields["__T6C0F3A95_REAL_.1f"], FieldValue::Float(31.5));
        measurements.assert_async().await;
        controls.assert_async().await;
        equitherm.assert_async().await;
        settings.assert_async().await;
    }

    #[tokio::test]
    async fn logs_in_once_for_all_pages() {
        let mut server = Server::new_async().await;
        let redirect = login_redirect_mock(&mut server, "GET", "/PAGE214.XML")
            .expect(1)
            .create_async()
            .await;
        let login = login_mock(&mut server).expect(1).create_async().await;
        let mut pages = Vec::new();
        for page in POLLED_PAGES {
            let mock = server
                .mock("GET", format!("/{}", page.path()).as_str())
                .match_header("cookie", SESSION_COOKIE)
                .with_status(200)
                .with_body(markup(&[(page.path(), "x")]))
                .expect(1)
                .create_async()
                .await;
            pages.push(mock);
        }

        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        let fields = device.fetch_all().await.unwrap();
        assert_eq!(fields.len(), 3);
        redirect.assert_async().await;
        login.assert_async().await;
        for mock in pages {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn abort_policy_fails_on_any_page() {
        let mut server = Server::new_async().await;
        serve(&mut server, Page::Measurements, markup(&[("A", "1")])).await;
        server.mock("GET", "/PAGE215.XML").with_status(500).create_async().await;
        let equitherm = server.mock("GET", "/PAGE217.XML").expect(0).create_async().await;

        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        let error = device.fetch_all().await.unwrap_err();
        assert!(matches!(error, Error::Fetch(_, Page::Controls)), "{error:?}");
        assert_eq!(error.class(), ErrorClass::Communication);
        equitherm.assert_async().await;
    }

    #[tokio::test]
    async fn skip_policy_leaves_failed_page_out() {
        let mut server = Server::new_async().await;
        serve(&mut server, Page::Measurements, markup(&[("A", "1")])).await;
        server.mock("GET", "/PAGE215.XML").with_status(500).create_async().await;
        serve(&mut server, Page::Equitherm, markup(&[("C", "3")])).await;

        let device =
            Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::SkipFailed);
        let fields = device.fetch_all().await.unwrap();
        assert_eq!(fields, FieldMap::from([("A".into(), text("1")), ("C".into(), text("3"))]));
    }

    #[tokio::test]
    async fn skip_policy_still_aborts_on_authentication_failure() {
        let mut server = Server::new_async().await;
        serve(&mut server, Page::Measurements, markup(&[("A", "1")])).await;
        server.mock("GET", "/PAGE215.XML").with_status(403).create_async().await;
        let equitherm = server.mock("GET", "/PAGE217.XML").expect(0).create_async().await;

        let device =
            Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::SkipFailed);
        let error = device.fetch_all().await.unwrap_err();
        assert_eq!(error.class(), ErrorClass::Authentication);
        equitherm.assert_async().await;
    }

    #[tokio::test]
    async fn skip_policy_fails_when_nothing_could_be_read() {
        let mut server = Server::new_async().await;
        for page in POLLED_PAGES {
            server
                .mock("GET", format!("/{}", page.path()).as_str())
                .with_status(503)
                .create_async()
                .await;
        }

        let device =
            Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::SkipFailed);
        let error = device.fetch_all().await.unwrap_err();
        assert!(matches!(error, Error::Fetch(_, Page::Equitherm)), "{error:?}");
    }

    #[tokio::test]
    async fn truncated_page_keeps_complete_fields() {
        let mut server = Server::new_async().await;
        let truncated = "<PAGE><INPUT NAME=\"A\" VALUE=\"1\"/><INPUT NAME=\"B\"".to_string();
        serve(&mut server, Page::Measurements, truncated).await;
        serve(&mut server, Page::Controls, markup(&[("C", "3")])).await;
        serve(&mut server, Page::Equitherm, markup(&[])).await;

        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        let fields = device.fetch_page(Page::Measurements).await.unwrap();
        assert_eq!(fields, FieldMap::from([("A".into(), text("1"))]));
        let fields = device.fetch_all().await.unwrap();
        assert_eq!(fields, FieldMap::from([("A".into(), text("1")), ("C".into(), text("3"))]));
    }

    #[tokio::test]
    async fn writes_domestic_hot_water_temperature() {
        let mut server = Server::new_async().await;
        let redirect = login_redirect_mock(&mut server, "POST", "/PAGE215.XML")
            .expect(1)
            .create_async()
            .await;
        let login = login_mock(&mut server).expect(1).create_async().await;
        let write = server
            .mock("POST", "/PAGE215.XML")
            .match_header("cookie", SESSION_COOKIE)
            .match_body(Matcher::UrlEncoded("__TF05C29B3_REAL_.1f=21.5".into(), "".into()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        device.set_domestic_hot_water_temperature(21.5).await.unwrap();
        redirect.assert_async().await;
        login.assert_async().await;
        write.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_write_is_an_authentication_error() {
        let mut server = Server::new_async().await;
        server.mock("POST", "/PAGE215.XML").with_status(401).create_async().await;

        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        let error = device.set_domestic_hot_water_temperature(45.0).await.unwrap_err();
        assert!(matches!(error, Error::WriteSetpoint(_)));
        assert_eq!(error.class(), ErrorClass::Authentication);
    }

    #[tokio::test]
    async fn out_of_range_setpoint_is_not_sent() {
        let mut server = Server::new_async().await;
        let write = server.mock("POST", "/PAGE215.XML").expect(0).create_async().await;

        let device = Device::new(session_for(&server, Duration::from_secs(5)), MergePolicy::Abort);
        for celsius in [9.9, 56.1, f64::NAN] {
            let error = device.set_domestic_hot_water_temperature(celsius).await.unwrap_err();
            assert!(matches!(error, Error::SetpointOutOfRange(_)));
            assert_eq!(error.class(), ErrorClass::General);
        }
        write.assert_async().await;
    }
}
