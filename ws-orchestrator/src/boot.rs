//! Boot configuration (cloud-init) for workspace instances

use base64::{engine::general_purpose::STANDARD, Engine};
use tera::{Context as TeraContext, Tera};

use crate::error::Result;

const CLOUD_INIT_TEMPLATE: &str = include_str!("../templates/cloud-init.yaml.j2");

/// Where re-injected application credentials are written on the instance.
pub const CREDENTIALS_PATH: &str = "/root/.config/workspace/credentials.json";

/// Everything an instance needs to come up on its own.
#[derive(Clone)]
pub struct BootConfig<'a> {
    pub hostname: &'a str,
    pub mesh_auth_key: &'a str,
    pub volume_device: &'a str,
    pub mount_path: &'a str,
    pub credentials: Option<&'a str>,
    pub capture_token: Option<&'a str>,
    pub callback_url: Option<&'a str>,
    pub terminal_command: &'a str,
    pub ssh_public_key: Option<&'a str>,
}

impl BootConfig<'_> {
    pub fn render(&self) -> Result<String> {
        let mut tera = Tera::default();
        tera.add_raw_template("cloud-init.yaml", CLOUD_INIT_TEMPLATE)?;

        let capture_env = match (self.capture_token, self.callback_url) {
            (Some(token), Some(url)) => Some(format!(
                "CAPTURE_TOKEN={token}\nCAPTURE_URL={url}\nCAPTURE_FILE={CREDENTIALS_PATH}\n"
            )),
            _ => None,
        };

        let mut context = TeraContext::new();
        context.insert("hostname", self.hostname);
        context.insert("ssh_public_key", &self.ssh_public_key.map(str::trim));
        context.insert("mesh_key_b64", &STANDARD.encode(self.mesh_auth_key));
        context.insert(
            "capture_env_b64",
            &capture_env.map(|env| STANDARD.encode(env)),
        );
        context.insert("credentials_path", CREDENTIALS_PATH);
        context.insert(
            "credentials_b64",
            &self.credentials.map(|creds| STANDARD.encode(creds)),
        );
        context.insert("volume_device", self.volume_device);
        context.insert("mount_path", self.mount_path);
        context.insert("mount_script", &mount_script(self.volume_device));
        context.insert(
            "terminal_script",
            &format!(
                "nohup {} >/var/log/workspace-terminal.log 2>&1 &",
                self.terminal_command
            ),
        );

        Ok(tera.render("cloud-init.yaml", &context)?)
    }
}

// Format the volume on first use only; existing data must survive.
fn mount_script(device: &str) -> String {
    let device = shell_quote(device);
    format!("blkid {device} || mkfs.ext4 -F {device}; mount -a")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
